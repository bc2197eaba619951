//! Marker protocol between the manager and an interactive interpreter.
//!
//! Every request is rewritten into a single REPL line that prints a
//! start marker, runs the user code, prints a JSON error payload after
//! an error marker when the code raises, and always prints an end
//! marker. The markers carry a per-call UUID, so collision with user
//! output is negligible and stale output from an abandoned call is
//! discarded by the next parser.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Written to a kernel's stdin to request a clean interpreter exit.
pub const QUIT_COMMAND: &str = "raise SystemExit\n";

/// Structured error reported by the interpreter wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// Marker strings delimiting one execution on the interpreter's stdout.
#[derive(Debug, Clone)]
pub struct MarkerSet {
    pub start: String,
    pub end: String,
    pub error: String,
}

impl MarkerSet {
    /// Fresh markers for one execution.
    pub fn generate() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self {
            start: format!("<<NIMBUS:{token}:START>>"),
            end: format!("<<NIMBUS:{token}:END>>"),
            error: format!("<<NIMBUS:{token}:ERROR>>"),
        }
    }
}

/// Unique line a fresh interpreter prints once its init script ran.
pub fn ready_sentinel() -> String {
    format!("<<NIMBUS:READY:{}>>", Uuid::new_v4().simple())
}

/// Renders `text` as a python string literal. JSON string escaping is
/// valid python string syntax.
fn python_literal(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// Init script for a python kernel, as one REPL line: silences the
/// prompts, folds stderr into stdout, imports what the wrapper needs,
/// and prints the ready sentinel.
pub fn python_init(sentinel: &str) -> String {
    let body = format!(
        concat!(
            "import sys, json, traceback\n",
            "sys.ps1 = ''\n",
            "sys.ps2 = ''\n",
            "sys.stderr = sys.stdout\n",
            "print({sentinel}, flush=True)"
        ),
        sentinel = python_literal(sentinel),
    );
    format!("exec({})\n", python_literal(&body))
}

/// Wraps user code for one execution round trip, as one REPL line.
pub fn wrap_code(code: &str, markers: &MarkerSet) -> String {
    let body = format!(
        concat!(
            "print({start}, flush=True)\n",
            "try:\n",
            "    exec(compile({code}, '<session>', 'exec'), globals())\n",
            "except BaseException as exc:\n",
            "    print({error}, flush=True)\n",
            "    print(json.dumps({{'name': type(exc).__name__, 'message': str(exc), ",
            "'traceback': traceback.format_exc()}}), flush=True)\n",
            "finally:\n",
            "    print({end}, flush=True)"
        ),
        start = python_literal(&markers.start),
        code = python_literal(code),
        error = python_literal(&markers.error),
        end = python_literal(&markers.end),
    );
    format!("exec({})\n", python_literal(&body))
}

enum ParserState {
    AwaitingStart,
    Capturing,
    AwaitingErrorPayload,
    Finished,
}

/// Incremental parser for one execution's stdout stream.
pub struct ExecutionParser {
    markers: MarkerSet,
    state: ParserState,
    error: Option<KernelError>,
}

impl ExecutionParser {
    pub fn new(markers: MarkerSet) -> Self {
        Self {
            markers,
            state: ParserState::AwaitingStart,
            error: None,
        }
    }

    /// Feeds one interpreter line. Returns the line when it belongs to
    /// the execution's visible output.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        match self.state {
            ParserState::AwaitingStart => {
                // Anything before our start marker is stale output.
                if line.contains(&self.markers.start) {
                    self.state = ParserState::Capturing;
                }
                None
            }
            ParserState::Capturing => {
                if line.contains(&self.markers.end) {
                    self.state = ParserState::Finished;
                    None
                } else if line.contains(&self.markers.error) {
                    self.state = ParserState::AwaitingErrorPayload;
                    None
                } else {
                    Some(line.to_string())
                }
            }
            ParserState::AwaitingErrorPayload => {
                self.error = Some(serde_json::from_str(line).unwrap_or_else(|_| KernelError {
                    name: "ExecutionError".to_string(),
                    message: line.to_string(),
                    traceback: None,
                }));
                self.state = ParserState::Capturing;
                None
            }
            ParserState::Finished => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, ParserState::Finished)
    }

    pub fn into_error(self) -> Option<KernelError> {
        self.error
    }
}
