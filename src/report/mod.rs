//! Write-only renderings: the ledger status document and batch reports.

pub mod deployment;
pub mod ledger;

pub use deployment::{default_report_path, write_json};
pub use ledger::{render_markdown, write_markdown};

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    let tmp = path.with_file_name(name);

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}
