//! The standard rekon streams.
//!
//! | Stream            | Subjects                                   | Retention |
//! |-------------------|--------------------------------------------|-----------|
//! | `messages`        | `resources.>`, `events.>`, `drivers.>`     | Interest  |
//! | `pipeline-engine` | `pipelines.>`                              | WorkQueue |
//! | `logs`            | `logs.>`                                   | Limits    |

use rekon_core::subject::{
    LOGS_STREAM, LOGS_SUBJECTS, MESSAGES_STREAM, MESSAGES_SUBJECTS, PIPELINE_ENGINE_STREAM,
    PIPELINE_ENGINE_SUBJECTS,
};
use tracing::info;

use crate::bus::Bus;
use crate::error::BusResult;
use crate::stream::{RetentionPolicy, StreamConfig, StreamInfo};

/// Create (or update) every stream rekon components rely on.
pub fn provision(bus: &Bus, log_stream_max: usize) -> BusResult<Vec<StreamInfo>> {
    let streams = [
        StreamConfig::new(MESSAGES_STREAM, &MESSAGES_SUBJECTS, RetentionPolicy::Interest),
        StreamConfig::new(
            PIPELINE_ENGINE_STREAM,
            &PIPELINE_ENGINE_SUBJECTS,
            RetentionPolicy::WorkQueue,
        ),
        StreamConfig::new(LOGS_STREAM, &LOGS_SUBJECTS, RetentionPolicy::Limits)
            .with_max_messages(log_stream_max),
    ];

    let mut infos = Vec::with_capacity(streams.len());
    for config in streams {
        infos.push(bus.add_stream(config)?);
    }
    info!(streams = infos.len(), "bus topology provisioned");
    Ok(infos)
}
