use iocgraph_dsl::macros::MacroContext;
use proptest::prelude::*;

fn macro_name() -> impl Strategy<Value = String> {
    // Keep names small and readable (and compatible with the reference form).
    proptest::string::string_regex("[A-Za-z][A-Za-z0-9_]{0,8}").unwrap()
}

fn macro_value() -> impl Strategy<Value = String> {
    // Values free of `$`, quotes and commas expand to themselves.
    proptest::string::string_regex("[A-Za-z0-9_:. /-]{0,16}").unwrap()
}

proptest! {
    #[test]
    fn defined_names_expand_to_their_values(
        defs in proptest::collection::btree_map(macro_name(), macro_value(), 1..8)
    ) {
        let mut ctx = MacroContext::new();
        for (name, value) in &defs {
            ctx.define(name.clone(), value.clone());
        }
        for (name, value) in &defs {
            prop_assert_eq!(&ctx.expand(&format!("$({name})")), value);
            prop_assert_eq!(&ctx.expand(&format!("${{{name}}}")), value);
        }
    }

    #[test]
    fn scoped_overrides_always_revert(
        defs in proptest::collection::btree_map(macro_name(), macro_value(), 1..6),
        overrides in proptest::collection::btree_map(macro_name(), macro_value(), 1..6)
    ) {
        let mut ctx = MacroContext::new();
        for (name, value) in &defs {
            ctx.define(name.clone(), value.clone());
        }
        let before = ctx.definitions_flat();
        {
            let scope = ctx.scoped(overrides.clone().into_iter().collect::<Vec<_>>());
            for (name, value) in &overrides {
                prop_assert_eq!(&scope.expand(&format!("$({name})")), value);
            }
        }
        prop_assert_eq!(ctx.definitions_flat(), before);
    }

    #[test]
    fn define_string_round_trips_pairs(
        // Definition parsing trims around `=`, so keep values space-free here.
        defs in proptest::collection::vec(
            (macro_name(), proptest::string::string_regex("[A-Za-z0-9_:./-]{0,16}").unwrap()),
            1..6
        )
    ) {
        let joined = defs
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut ctx = MacroContext::new();
        let parsed = ctx.define_from_string(&joined).expect("defs");
        prop_assert_eq!(parsed, defs);
    }

    #[test]
    fn text_without_references_is_untouched(
        text in proptest::string::string_regex("[A-Za-z0-9_:. /=,-]{0,40}").unwrap()
    ) {
        let ctx = MacroContext::new();
        prop_assert_eq!(ctx.expand(&text), text);
    }
}
