use iocgraph_shell::state::Outcome;
use iocgraph_shell::{load_ioc, InterpreterOptions, ShellInterpreter};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const SOFT_DBD: &str = r#"
recordtype(ai) {
    field(VAL, DBF_DOUBLE) {
        prompt("Current EGU Value")
    }
    field(DESC, DBF_STRING) {
        prompt("Descriptor")
    }
    field(INP, DBF_INLINK) {
        prompt("Input Specification")
    }
    field(DTYP, DBF_DEVICE) {
        prompt("Device Type")
    }
    field(FLNK, DBF_FWDLINK) {
        prompt("Forward Process Link")
    }
}
recordtype(ao) {
    field(VAL, DBF_DOUBLE) {
        prompt("Desired Output")
    }
    field(OUT, DBF_OUTLINK) {
        prompt("Output Specification")
    }
    field(DTYP, DBF_DEVICE) {
        prompt("Device Type")
    }
}
"#;

fn write(dir: &Path, name: &str, text: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, text).expect("write");
}

fn options(name: &str) -> InterpreterOptions {
    InterpreterOptions {
        name: name.to_string(),
        ..InterpreterOptions::default()
    }
}

#[test]
fn full_startup_script_loads_records_with_provenance() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(
        root,
        "db/temps.db",
        r#"
record(ai, "$(P):TEMP") {
    field(DESC, "Temperature")
    field(INP, "$(P):RAW CPP MS")
}
"#,
    );
    write(
        root,
        "st.cmd",
        r#"
epicsEnvSet("EPICS_BASE", "/opt/epics/base-3.15.9")
epicsEnvSet("P", "RING")
dbLoadDatabase("dbd/soft.dbd")
dbLoadRecords("db/temps.db")
iocInit
"#,
    );

    let report = load_ioc(
        options("ioc-tests-01"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    assert!(report.ioc_initialized);
    assert_eq!(report.base_version.as_deref(), Some("3.15.9"));

    let record = &report.database.records["RING:TEMP"];
    assert_eq!(record.owner, "ioc-tests-01");
    assert_eq!(record.field_value("INP"), Some("RING:RAW CPP MS"));
    assert_eq!(record.fields["INP"].dtype, "DBF_INLINK");
    // st.cmd line 5 loaded the db; the field sits on db line 4.
    let ctx = record.fields["INP"].context.to_string();
    assert!(ctx.contains("st.cmd:5"), "ctx={ctx}");
    assert!(ctx.ends_with("temps.db:4"), "ctx={ctx}");

    // Every read file landed in the digest ledger.
    assert_eq!(report.loaded_files.len(), 3);
    assert!(report
        .loaded_files
        .values()
        .all(|digest| digest.starts_with("sha256:")));
}

#[test]
fn use_before_load_and_double_dbd_are_line_local_failures() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(root, "db/a.db", "record(ai, \"A\") {\n}\n");
    write(
        root,
        "st.cmd",
        r#"
dbLoadRecords("db/a.db")
dbLoadDatabase("dbd/soft.dbd")
dbLoadDatabase("dbd/soft.dbd")
dbLoadRecords("db/a.db")
"#,
    );

    let report = load_ioc(
        options("ioc-tests-02"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    let outcomes: Vec<&Outcome> = report.results.iter().map(|r| &r.outcome).collect();
    assert!(
        matches!(outcomes[0], Outcome::Failure { class, .. } if class == "DbdNotLoaded"),
        "outcomes={outcomes:?}"
    );
    assert!(matches!(outcomes[1], Outcome::Success));
    assert!(
        matches!(outcomes[2], Outcome::Failure { class, .. } if class == "DbdAlreadyLoaded"),
        "second dbd load must fail non-fatally"
    );
    // The script carried on: the last load still worked.
    assert!(matches!(outcomes[3], Outcome::Success));
    assert!(report.database.records.contains_key("A"));
}

#[test]
fn load_after_init_is_rejected_and_database_unchanged() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(root, "db/a.db", "record(ai, \"A\") {\n}\n");
    write(root, "db/b.db", "record(ai, \"B\") {\n}\n");
    write(
        root,
        "st.cmd",
        r#"
dbLoadDatabase("dbd/soft.dbd")
dbLoadRecords("db/a.db")
iocInit
dbLoadRecords("db/b.db")
iocInit
"#,
    );

    let report = load_ioc(
        options("ioc-tests-03"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    let late_load = &report.results[3];
    assert!(
        matches!(&late_load.outcome, Outcome::Failure { class, .. } if class == "LoadAfterInit")
    );
    assert!(!report.database.records.contains_key("B"));

    let second_init = &report.results[4];
    assert!(
        matches!(&second_init.outcome, Outcome::Failure { class, .. } if class == "AlreadyInitialized")
    );
}

#[test]
fn redirects_inline_included_lines_and_missing_includes_are_local() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(root, "db/a.db", "record(ai, \"A\") {\n}\n");
    write(
        root,
        "common.cmd",
        "dbLoadRecords(\"db/a.db\")\n",
    );
    write(
        root,
        "st.cmd",
        r#"
dbLoadDatabase("dbd/soft.dbd")
< common.cmd
< missing.cmd
iocInit
"#,
    );

    let report = load_ioc(
        options("ioc-tests-04"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    // dbd, redirect line, inlined dbLoadRecords, failed redirect, iocInit.
    assert_eq!(report.results.len(), 5);
    assert!(matches!(report.results[1].outcome, Outcome::Success));
    let inlined = &report.results[2];
    assert!(inlined.line.starts_with("dbLoadRecords"));
    let ctx = inlined.context.to_string();
    assert!(ctx.contains("st.cmd:3"), "ctx={ctx}");
    assert!(ctx.ends_with("common.cmd:1"), "ctx={ctx}");
    assert!(
        matches!(&report.results[3].outcome, Outcome::Failure { class, .. } if class == "FileNotFound")
    );
    assert!(report.ioc_initialized);
    assert!(report.database.records.contains_key("A"));
}

#[test]
fn template_expansion_loads_one_merge_per_row() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(
        root,
        "db/stage.template",
        r#"
record(ao, "$(P):SET$(N)") {
    field(VAL, "0")
}
"#,
    );
    write(
        root,
        "db/stages.substitutions",
        r#"
file "db/stage.template" {
    pattern {P, N}
    {RING, 1}
    {RING, 2}
}
"#,
    );
    write(
        root,
        "st.cmd",
        r#"
dbLoadDatabase("dbd/soft.dbd")
dbLoadTemplate("db/stages.substitutions")
iocInit
"#,
    );

    let report = load_ioc(
        options("ioc-tests-05"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    assert!(report.database.records.contains_key("RING:SET1"));
    assert!(report.database.records.contains_key("RING:SET2"));
    let template_result = &report.results[1];
    assert_eq!(template_result.notes["rows"], "2");
}

#[test]
fn handlers_register_devices_and_annotate_records() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(
        root,
        "db/motor.db",
        r#"
record(ao, "M1") {
    field(DTYP, "asynMotor")
    field(OUT, "@asyn(XPS1, 0)")
}
record(ai, "T1") {
    field(DTYP, "stream")
    field(INP, "@asyn(TTY0, 0)")
}
"#,
    );
    write(
        root,
        "st.cmd",
        r#"
dbLoadDatabase("dbd/soft.dbd")
drvAsynSerialPortConfigure("TTY0", "/dev/ttyS0", 0, 0, 0)
drvAsynIPPortConfigure("IP1", "10.0.0.5:5000")
XPSCreateController("XPS1", "IP1", 8)
GhostCreateController("GHOST", "NOPORT", 2)
dbLoadRecords("db/motor.db")
someVendorSpecificCommand 1, 2
iocInit
"#,
    );

    let report = load_ioc(
        options("ioc-tests-06"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    // Missing asyn port: local failure, controller kept with no port.
    let ghost = report
        .results
        .iter()
        .find(|r| r.line.starts_with("GhostCreateController"))
        .expect("ghost result");
    assert!(
        matches!(&ghost.outcome, Outcome::Failure { class, .. } if class == "MissingReference")
    );

    // Unknown command: recorded, not an error.
    let vendor = report
        .results
        .iter()
        .find(|r| r.line.starts_with("someVendorSpecificCommand"))
        .expect("vendor result");
    assert!(matches!(vendor.outcome, Outcome::Unhandled));
    assert_eq!(report.unhandled_commands["someVendorSpecificCommand"], 1);

    let motor = &report.database.records["M1"];
    match motor.metadata.get("motor").expect("motor metadata") {
        iocgraph_dsl::model::MetadataValue::Map(map) => {
            assert_eq!(map["controller"], "XPS1");
            assert_eq!(map["axis"], "0");
            assert_eq!(map["port"], "IP1");
            assert_eq!(map["address"], "10.0.0.5:5000");
        }
        other => panic!("unexpected metadata: {other:?}"),
    }

    let temp = &report.database.records["T1"];
    match temp.metadata.get("asyn").expect("asyn metadata") {
        iocgraph_dsl::model::MetadataValue::Map(map) => {
            assert_eq!(map["port"], "TTY0");
            assert_eq!(map["kind"], "serial");
        }
        other => panic!("unexpected metadata: {other:?}"),
    }
}

#[test]
fn autosave_restores_run_during_ioc_init() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    write(root, "db/a.db", "record(ao, \"STAGE:POS\") {\n}\n");
    write(
        root,
        "autosave/positions.sav",
        "STAGE:POS.VAL 12.5\n<END>\n",
    );
    write(
        root,
        "st.cmd",
        r#"
dbLoadDatabase("dbd/soft.dbd")
dbLoadRecords("db/a.db")
set_savefile_path("autosave")
set_pass0_restoreFile("positions.sav")
iocInit
"#,
    );

    let report = load_ioc(
        options("ioc-tests-07"),
        &root.join("st.cmd").display().to_string(),
    )
    .expect("script exists");

    let init = report
        .results
        .iter()
        .find(|r| r.line.starts_with("iocInit"))
        .expect("iocInit result");
    assert_eq!(init.notes["autosave.restored_pass0"], "1");

    let record = &report.database.records["STAGE:POS"];
    match record.metadata.get("autosave").expect("autosave metadata") {
        iocgraph_dsl::model::MetadataValue::Map(map) => {
            assert_eq!(map["VAL"], "12.5");
        }
        other => panic!("unexpected metadata: {other:?}"),
    }
    // The restore file itself is part of the load ledger.
    assert!(report
        .loaded_files
        .keys()
        .any(|path| path.ends_with("positions.sav")));
}

#[test]
fn cd_failures_are_line_local() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    write(root, "dbd/soft.dbd", SOFT_DBD);
    fs::create_dir_all(root.join("sub")).expect("mkdir");
    write(
        root,
        "st.cmd",
        r#"
cd "nowhere-at-all"
cd "sub"
"#,
    );

    let mut interpreter = ShellInterpreter::new(options("ioc-tests-08"));
    let results = interpreter
        .interpret_script(&root.join("st.cmd").display().to_string())
        .expect("script exists");
    assert!(
        matches!(&results[0].outcome, Outcome::Failure { class, .. } if class == "FileNotFound")
    );
    assert!(matches!(results[1].outcome, Outcome::Success));
    assert!(interpreter.state.cwd.ends_with("sub"));
}
