//! Resource classes guarded by the concurrency gate.

use serde::{Deserialize, Serialize};

/// A class of expensive operation whose process-wide concurrency is capped.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// OCR recognition (external process / CPU heavy).
    Ocr,
    /// Bulk (zip) export of documents.
    BulkExport,
    /// Downloading messages and attachments from a mailbox.
    EmailDownload,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 3] = [Self::Ocr, Self::BulkExport, Self::EmailDownload];

    /// Human-readable label used in log lines and busy messages.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::BulkExport => "bulk export",
            Self::EmailDownload => "email download",
        }
    }
}

impl core::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}
