//! Schema files compiled into the crate

/// Shared schema for the `meta` object of every event
pub(crate) const META_SCHEMA: &str = include_str!("../../schemas/meta.json");

/// `(event type, version, schema document)` for every bundled definition
pub(crate) const BUNDLED_SCHEMAS: &[(&str, &str, &str)] = &[
    ("EiffelActivityTriggeredEvent", "4.0.0", include_str!("../../schemas/EiffelActivityTriggeredEvent/4.0.0.json")),
    ("EiffelActivityTriggeredEvent", "4.2.0", include_str!("../../schemas/EiffelActivityTriggeredEvent/4.2.0.json")),
    ("EiffelActivityStartedEvent", "4.0.0", include_str!("../../schemas/EiffelActivityStartedEvent/4.0.0.json")),
    ("EiffelActivityStartedEvent", "4.3.0", include_str!("../../schemas/EiffelActivityStartedEvent/4.3.0.json")),
    ("EiffelActivityFinishedEvent", "3.0.0", include_str!("../../schemas/EiffelActivityFinishedEvent/3.0.0.json")),
    ("EiffelActivityFinishedEvent", "3.3.0", include_str!("../../schemas/EiffelActivityFinishedEvent/3.3.0.json")),
    ("EiffelActivityCanceledEvent", "3.0.0", include_str!("../../schemas/EiffelActivityCanceledEvent/3.0.0.json")),
    ("EiffelAnnouncementPublishedEvent", "3.0.0", include_str!("../../schemas/EiffelAnnouncementPublishedEvent/3.0.0.json")),
    ("EiffelArtifactCreatedEvent", "3.3.0", include_str!("../../schemas/EiffelArtifactCreatedEvent/3.3.0.json")),
    ("EiffelArtifactPublishedEvent", "3.1.0", include_str!("../../schemas/EiffelArtifactPublishedEvent/3.1.0.json")),
    ("EiffelArtifactReusedEvent", "3.2.0", include_str!("../../schemas/EiffelArtifactReusedEvent/3.2.0.json")),
    ("EiffelCompositionDefinedEvent", "3.2.0", include_str!("../../schemas/EiffelCompositionDefinedEvent/3.2.0.json")),
    ("EiffelConfidenceLevelModifiedEvent", "3.2.0", include_str!("../../schemas/EiffelConfidenceLevelModifiedEvent/3.2.0.json")),
    ("EiffelEnvironmentDefinedEvent", "3.2.0", include_str!("../../schemas/EiffelEnvironmentDefinedEvent/3.2.0.json")),
    ("EiffelFlowContextDefinedEvent", "3.0.0", include_str!("../../schemas/EiffelFlowContextDefinedEvent/3.0.0.json")),
    ("EiffelSourceChangeCreatedEvent", "4.2.0", include_str!("../../schemas/EiffelSourceChangeCreatedEvent/4.2.0.json")),
    ("EiffelSourceChangeSubmittedEvent", "3.0.0", include_str!("../../schemas/EiffelSourceChangeSubmittedEvent/3.0.0.json")),
    ("EiffelTestCaseTriggeredEvent", "3.0.0", include_str!("../../schemas/EiffelTestCaseTriggeredEvent/3.0.0.json")),
    ("EiffelTestCaseStartedEvent", "3.0.0", include_str!("../../schemas/EiffelTestCaseStartedEvent/3.0.0.json")),
    ("EiffelTestCaseFinishedEvent", "3.0.0", include_str!("../../schemas/EiffelTestCaseFinishedEvent/3.0.0.json")),
    ("EiffelTestCaseCanceledEvent", "3.2.0", include_str!("../../schemas/EiffelTestCaseCanceledEvent/3.2.0.json")),
    ("EiffelTestSuiteStartedEvent", "3.3.0", include_str!("../../schemas/EiffelTestSuiteStartedEvent/3.3.0.json")),
    ("EiffelTestSuiteFinishedEvent", "3.3.0", include_str!("../../schemas/EiffelTestSuiteFinishedEvent/3.3.0.json")),
];
