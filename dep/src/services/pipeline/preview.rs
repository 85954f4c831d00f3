//! Preview images of archived files.

use std::path::{Path, PathBuf};

use crate::fits::FitsFile;

/// Renders a preview next to an archived FITS file.
pub trait PreviewRenderer: Send + Sync {
    /// Returns the path of the written preview, or `None` when nothing was
    /// rendered.
    fn render(&self, fits: &FitsFile, fits_path: &Path) -> Result<Option<PathBuf>, String>;
}

/// Renders nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreview;

impl PreviewRenderer for NoPreview {
    fn render(&self, _fits: &FitsFile, _fits_path: &Path) -> Result<Option<PathBuf>, String> {
        Ok(None)
    }
}
