//! Entrypoint commands for the algorithm and metrics images.

use crate::models::InputModelRef;
use crate::sandbox::MODEL_FILENAME;
use container_exec::CommandSpec;

pub const FAKE_DATA_FLAG: &str = "--fake-data";
pub const METRICS_MODE_FLAG: &str = "--fake-data-mode";
pub const METRICS_FAKE_Y: &str = "FAKE_Y";
pub const METRICS_NO_FAKE_Y: &str = "DISABLED";

/// `train [--fake-data] [--rank N]`; model keys are appended by [`with_model_keys`].
pub fn train_command(fake_data_samples: bool, rank: Option<u32>) -> CommandSpec {
    let mut command = CommandSpec::new("train");
    if fake_data_samples {
        command.push(FAKE_DATA_FLAG);
    }
    if let Some(rank) = rank {
        command.push("--rank");
        command.push(rank.to_string());
    }
    command
}

/// Append input model keys in linking order. No models, no change.
pub fn with_model_keys(command: &mut CommandSpec, models: &[InputModelRef]) {
    command.extend(models.iter().map(|model| model.key.clone()));
}

/// `predict model [--fake-data]`
pub fn predict_command(fake_data_samples: bool) -> CommandSpec {
    let mut command = CommandSpec::new("predict").arg(MODEL_FILENAME);
    if fake_data_samples {
        command.push(FAKE_DATA_FLAG);
    }
    command
}

/// `--fake-data-mode FAKE_Y|DISABLED`
pub fn metrics_command(fake_data_samples: bool) -> CommandSpec {
    let mode = if fake_data_samples {
        METRICS_FAKE_Y
    } else {
        METRICS_NO_FAKE_Y
    };
    CommandSpec::new(METRICS_MODE_FLAG).arg(mode)
}
