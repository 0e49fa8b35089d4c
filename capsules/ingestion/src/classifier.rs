//! Classification of container output lines.
//!
//! Every line ends up in the outputs map exactly once: either as the
//! key/value pairs it declares, or verbatim under the next positional key
//! (`"1"`, `"2"`, ...).

use crate::engine::{LogSink, StreamKind};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

/// Lines mentioning this token are informational whatever stream they came on.
pub const INFO_MARKER: &str = "INFO";

static OUTPUT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^::(\{.*\})::$").expect("output marker pattern compiles"));

/// Extracts declared outputs from a single line. An empty map means the line
/// declares nothing.
pub trait LineParser: Send + Sync {
    fn parse(&self, line: &str) -> Map<String, Value>;
}

/// Recognises `::{"outputs": {"key": value, ...}}::` lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarkerLineParser;

impl LineParser for MarkerLineParser {
    fn parse(&self, line: &str) -> Map<String, Value> {
        let Some(captures) = OUTPUT_LINE.captures(line.trim()) else {
            return Map::new();
        };

        match serde_json::from_str::<Value>(&captures[1]) {
            Ok(Value::Object(mut declared)) => match declared.remove("outputs") {
                Some(Value::Object(outputs)) => outputs,
                _ => Map::new(),
            },
            Ok(_) => Map::new(),
            Err(e) => {
                warn!(error = %e, "ignoring malformed output line");
                Map::new()
            }
        }
    }
}

/// Outputs and line counts gathered from one container run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassifiedOutput {
    pub outputs: Map<String, Value>,
    pub std_out_lines: u64,
    pub std_err_lines: u64,
}

/// Single-writer accumulator fed line by line during the log pass.
pub struct OutputClassifier {
    parser: Arc<dyn LineParser>,
    state: ClassifiedOutput,
    positional: u64,
}

impl OutputClassifier {
    pub fn new(parser: Arc<dyn LineParser>) -> Self {
        Self {
            parser,
            state: ClassifiedOutput::default(),
            positional: 0,
        }
    }

    pub fn classify(&mut self, line: &str, declared: StreamKind) {
        let stream = if line.contains(INFO_MARKER) {
            StreamKind::Stdout
        } else {
            declared
        };

        if mirror_level(stream) == Level::ERROR {
            error!(target: "ingestion::container", "{}", line);
        } else {
            info!(target: "ingestion::container", "{}", line);
        }

        let declared_outputs = self.parser.parse(line);
        if declared_outputs.is_empty() {
            self.positional += 1;
            self.state
                .outputs
                .insert(self.positional.to_string(), Value::String(line.to_string()));
        } else {
            self.state.outputs.extend(declared_outputs);
        }

        match stream {
            StreamKind::Stdout => self.state.std_out_lines += 1,
            StreamKind::Stderr => self.state.std_err_lines += 1,
        }
    }

    pub fn state(&self) -> &ClassifiedOutput {
        &self.state
    }

    pub fn finish(self) -> ClassifiedOutput {
        self.state
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new(Arc::new(MarkerLineParser))
    }
}

impl LogSink for OutputClassifier {
    fn accept(&mut self, line: &str, stream: StreamKind) {
        self.classify(line, stream);
    }
}

/// Level a classified line is mirrored at under `ingestion::container`.
pub(crate) fn mirror_level(stream: StreamKind) -> Level {
    match stream {
        StreamKind::Stdout => Level::INFO,
        StreamKind::Stderr => Level::ERROR,
    }
}
