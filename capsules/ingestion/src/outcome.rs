use crate::classifier::ClassifiedOutput;
use config_loader::OutcomeForm;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyOutcome {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionOutput {
    pub exit_code: i64,
    pub outputs: Map<String, Value>,
    pub std_out_line_count: u64,
    pub std_err_line_count: u64,
}

/// Result handed back to the workflow: `{success}` or the detailed form,
/// never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionOutcome {
    Legacy(LegacyOutcome),
    Detailed(IngestionOutput),
}

impl ExecutionOutcome {
    /// Exit status 0 is success; anything else is a failure that still
    /// carries whatever was collected before the container stopped.
    pub fn build(form: OutcomeForm, exit_code: i64, classified: ClassifiedOutput) -> Self {
        match form {
            OutcomeForm::Legacy => ExecutionOutcome::Legacy(LegacyOutcome {
                success: exit_code == 0,
            }),
            OutcomeForm::Detailed => ExecutionOutcome::Detailed(IngestionOutput {
                exit_code,
                outputs: classified.outputs,
                std_out_line_count: classified.std_out_lines,
                std_err_line_count: classified.std_err_lines,
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ExecutionOutcome::Legacy(legacy) => legacy.success,
            ExecutionOutcome::Detailed(output) => output.exit_code == 0,
        }
    }

    /// `None` for the legacy form, which does not keep the code.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            ExecutionOutcome::Legacy(_) => None,
            ExecutionOutcome::Detailed(output) => Some(output.exit_code),
        }
    }
}
