//! Diagnostics reported to the application, and decoding of the error records
//! written by instrumented shaders.

use crate::interface::{self, ErrorCode};
use parking_lot::Mutex;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum DiagnosticKind {
    /// A shader couldn't be parsed, and is used uninstrumented.
    ShaderParse,

    /// Linking (or serializing) the instrumented shader failed, and the
    /// original shader is used instead.
    InstrumentationFailed,

    /// Some operations in a shader couldn't be instrumented.
    PartialInstrumentation,

    /// A descriptor set snapshot (or address table) couldn't be built, and
    /// the checks relying on it are skipped for one command.
    SnapshotUnavailable,

    /// The instrumentation buffers for a command couldn't be allocated.
    ResourceAllocation,

    /// An error detected by an instrumented shader.
    Gpu(ErrorCode),

    /// An error record with an unknown code, or for an unknown shader.
    MalformedRecord,

    /// More errors were detected than the output buffer had room for.
    OutputOverflow,

    /// A command uses the descriptor set reserved for instrumentation.
    ReservedSetInUse,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    pub unique_shader_id: Option<u32>,
}

impl Diagnostic {
    pub fn new(severity: Severity, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self { severity, kind, message: message.into(), unique_shader_id: None }
    }

    pub fn with_shader(self, unique_shader_id: u32) -> Self {
        Self { unique_shader_id: Some(unique_shader_id), ..self }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] ", self.kind)?;
        if let Some(id) = self.unique_shader_id {
            write!(f, "(shader {id}) ")?;
        }
        f.write_str(&self.message)
    }
}

/// Destination of diagnostics (e.g. the debug messenger of the instance).
pub trait ReportSink: Send + Sync {
    fn report(&self, diag: Diagnostic);
}

/// [`ReportSink`] forwarding everything to `tracing`.
#[derive(Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn report(&self, diag: Diagnostic) {
        match diag.severity {
            Severity::Info => tracing::info!(kind = ?diag.kind, "{diag}"),
            Severity::Warning => tracing::warn!(kind = ?diag.kind, "{diag}"),
            Severity::Error => tracing::error!(kind = ?diag.kind, "{diag}"),
        }
    }
}

/// [`ReportSink`] keeping every diagnostic, for later inspection.
#[derive(Default)]
pub struct RecordingSink {
    diags: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diags.lock())
    }

    pub fn len(&self) -> usize {
        self.diags.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for RecordingSink {
    fn report(&self, diag: Diagnostic) {
        self.diags.lock().push(diag);
    }
}

/// One error record, as written by `inst_log_error`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ErrorRecord {
    pub unique_shader_id: u32,
    pub inst_index: u32,
    pub code: u32,
    pub params: [u32; 4],
}

/// Result of decoding a whole output buffer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedOutput {
    pub records: Vec<ErrorRecord>,

    /// Records that didn't fit in the buffer (only their count is known).
    pub dropped: u32,
}

impl ErrorRecord {
    pub fn from_words(words: [u32; interface::ERROR_RECORD_WORDS as usize]) -> Self {
        let [unique_shader_id, inst_index, code, p0, p1, p2, p3] = words;
        Self { unique_shader_id, inst_index, code, params: [p0, p1, p2, p3] }
    }

    /// Decode the contents of an output buffer (`written_words`, then `data`).
    pub fn decode_output(words: &[u32]) -> DecodedOutput {
        let record_words = interface::ERROR_RECORD_WORDS as usize;
        let Some((&written, data)) = words.split_first() else {
            return DecodedOutput::default();
        };
        let written = written as usize;

        let records: Vec<_> = data[..written.min(data.len())]
            .chunks_exact(record_words)
            .filter_map(|chunk| Some(Self::from_words(chunk.try_into().ok()?)))
            .collect();
        let dropped = (written / record_words).saturating_sub(records.len());
        DecodedOutput { records, dropped: u32::try_from(dropped).unwrap_or(u32::MAX) }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_u32(self.code)
    }

    /// Human-readable description of the error (without location information).
    pub fn describe(&self) -> String {
        let [p0, p1, p2, _] = self.params;
        let f = f32::from_bits;
        match self.error_code() {
            Some(ErrorCode::DescriptorIndexOutOfBounds) => {
                let [set, binding, index, count] = self.params;
                format!(
                    "descriptor index {index} is out of bounds for set {set}, \
                     binding {binding} (which has {count} descriptors)"
                )
            }
            Some(ErrorCode::DescriptorUninitialized) => format!(
                "descriptor index {p2} of set {p0}, binding {p1} is used without being written"
            ),
            Some(ErrorCode::IndexOutOfBounds) => {
                format!("index {p0} is out of bounds (must be less than {p1})")
            }
            Some(ErrorCode::DeviceAddressOutOfBounds) => {
                let address = u64::from(p0) | (u64::from(p1) << 32);
                format!(
                    "access of {p2} bytes at device address {address:#x} is outside \
                     of every live buffer"
                )
            }
            Some(ErrorCode::RayQueryNegativeTMin) => {
                format!("ray query tmin ({}) is negative", f(p1))
            }
            Some(ErrorCode::RayQueryTMaxLessThanTMin) => {
                format!("ray query tmax ({}) is less than tmin ({})", f(p2), f(p1))
            }
            Some(ErrorCode::RayQueryNanVector) => {
                "ray query origin or direction contains NaN".to_string()
            }
            Some(ErrorCode::RayQueryBothSkipFlags) => format!(
                "ray query flags ({p0:#x}) contain both SkipTrianglesKHR and SkipAABBsKHR"
            ),
            None => format!("unknown error code {}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_counts_dropped_records() {
        // Two records written, but room for only one.
        let mut words = vec![14];
        words.extend([3, 5, 3, 9, 4, 0, 0]);
        words.extend([0; 3]);
        let out = ErrorRecord::decode_output(&words);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.records[0].error_code(), Some(ErrorCode::IndexOutOfBounds));
        assert_eq!(out.records[0].describe(), "index 9 is out of bounds (must be less than 4)");
    }

    #[test]
    fn empty_output_has_no_records() {
        assert_eq!(ErrorRecord::decode_output(&[]), DecodedOutput::default());
        assert_eq!(ErrorRecord::decode_output(&[0, 0, 0]), DecodedOutput::default());
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingSink::default();
        sink.report(Diagnostic::new(Severity::Warning, DiagnosticKind::ShaderParse, "a"));
        sink.report(
            Diagnostic::new(Severity::Error, DiagnosticKind::OutputOverflow, "b").with_shader(2),
        );
        let diags = sink.take();
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[1].to_string(), "[OutputOverflow] (shader 2) b");
        assert!(sink.is_empty());
    }
}
