//! Bus subject and stream naming.
//!
//! Subjects are dot-separated tokens. Resource changes fan out on
//! `resources.<type>`; driver outcomes and run lifecycle go to the
//! work-queue `pipelines.>` space; run state announcements go to
//! `events.runs.<pipeline>`.

/// Fan-out stream for resource changes, events and direct driver traffic.
pub const MESSAGES_STREAM: &str = "messages";

/// Work-queue stream consumed by the pipeline engine.
pub const PIPELINE_ENGINE_STREAM: &str = "pipeline-engine";

/// Stream holding driver log lines.
pub const LOGS_STREAM: &str = "logs";

/// Subject filters bound to [`MESSAGES_STREAM`].
pub const MESSAGES_SUBJECTS: [&str; 3] = ["resources.>", "events.>", "drivers.>"];

/// Subject filters bound to [`PIPELINE_ENGINE_STREAM`].
pub const PIPELINE_ENGINE_SUBJECTS: [&str; 1] = ["pipelines.>"];

/// Subject filters bound to [`LOGS_STREAM`].
pub const LOGS_SUBJECTS: [&str; 1] = ["logs.>"];

/// Subject carrying driver outcomes to the engine.
pub const DRIVER_RESULT_SUBJECT: &str = "pipelines.driver.result";

/// Subject announcing a new run to the engine.
pub const RUN_STARTED_SUBJECT: &str = "pipelines.run.started";

const RESOURCES_PREFIX: &str = "resources.";

/// `resources.<type>`
pub fn resource_subject(resource_type: &str) -> String {
    format!("{RESOURCES_PREFIX}{resource_type}")
}

/// Recover the resource type from a `resources.<type>` subject.
pub fn resource_type_of(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(RESOURCES_PREFIX)
        .filter(|rest| !rest.is_empty())
}

/// `events.runs.<pipeline>`
pub fn run_event_subject(pipeline: &str) -> String {
    format!("events.runs.{pipeline}")
}

/// `logs.<driver>`
pub fn log_subject(driver: &str) -> String {
    format!("logs.{driver}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_subject_round_trip() {
        let subject = resource_subject("pipe");
        assert_eq!(subject, "resources.pipe");
        assert_eq!(resource_type_of(&subject), Some("pipe"));
        assert_eq!(resource_type_of("resources."), None);
        assert_eq!(resource_type_of("pipelines.driver.result"), None);
    }
}
