//! Property tests for the event model and routing

use eiffel_event::broker::topic_matches;
use eiffel_event::subscriber::{binding_key, glob_matches};
use eiffel_event::{Event, CONTEXT};
use proptest::prelude::*;

fn triggered(name: &str, categories: &[String]) -> Event {
    let mut event = Event::new("EiffelActivityTriggeredEvent", "4.2.0").unwrap();
    event.data.add("name", name);
    if !categories.is_empty() {
        event.data.add("categories", serde_json::json!(categories));
    }
    event
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    /// Property: a valid event survives the wire unchanged and stays valid.
    #[test]
    fn wire_roundtrip_preserves_event(
        name in "\\PC{0,40}",
        categories in prop::collection::vec("[a-z]{1,10}", 0..4),
        with_context in any::<bool>(),
    ) {
        let mut event = triggered(&name, &categories);
        if with_context {
            event.links.add(CONTEXT, uuid::Uuid::new_v4());
        }
        prop_assert!(event.validate().unwrap().is_empty());

        let decoded = Event::from_wire(&event.to_wire().unwrap()).unwrap();
        prop_assert_eq!(decoded.meta(), event.meta());
        prop_assert_eq!(&decoded.data, &event.data);
        prop_assert_eq!(&decoded.links, &event.links);
        prop_assert_eq!(decoded.context(), event.context());
        prop_assert!(decoded.validate().unwrap().is_empty());
    }

    /// Property: the routing key depends only on type and segments, and the
    /// exact-type binding always routes it.
    #[test]
    fn routing_key_is_deterministic(
        family in proptest::option::of("[a-z0-9_-]{1,12}"),
        tag in proptest::option::of("[a-z0-9_-]{1,12}"),
        domain in proptest::option::of("[a-z0-9_-]{1,12}"),
    ) {
        let build = || {
            let mut event = triggered("x", &[]);
            if let Some(family) = &family {
                event = event.with_family(family.clone());
            }
            if let Some(tag) = &tag {
                event = event.with_tag(tag.clone());
            }
            if let Some(domain) = &domain {
                event = event.with_domain_id(domain.clone());
            }
            event
        };
        let (first, second) = (build(), build());
        prop_assert_ne!(first.id(), second.id());
        prop_assert_eq!(first.routing_key(), second.routing_key());

        let key = first.routing_key();
        let segments: Vec<&str> = key.split('.').collect();
        prop_assert_eq!(segments.len(), 5);
        prop_assert_eq!(segments[0], "eiffel");
        prop_assert_eq!(segments[1], family.as_deref().unwrap_or("_"));
        prop_assert_eq!(segments[2], "EiffelActivityTriggeredEvent");
        prop_assert_eq!(segments[3], tag.as_deref().unwrap_or("_"));
        prop_assert_eq!(segments[4], domain.as_deref().unwrap_or("_"));

        prop_assert!(topic_matches(&binding_key("EiffelActivityTriggeredEvent"), &key));
        prop_assert!(topic_matches(&binding_key("Eiffel*"), &key));
        prop_assert!(!topic_matches(&binding_key("EiffelActivityStartedEvent"), &key));
    }

    /// Property: a literal pattern matches only itself; `*` matches anything.
    #[test]
    fn glob_literal_and_star(text in "[A-Za-z]{0,30}", other in "[A-Za-z]{1,30}") {
        prop_assert!(glob_matches(&text, &text));
        prop_assert!(glob_matches("*", &text));
        let prefix_pattern = format!("{text}*");
        let prefixed = format!("{text}{other}");
        prop_assert!(glob_matches(&prefix_pattern, &prefixed));
        prop_assert_eq!(glob_matches(&text, &other), text == other);
    }
}
