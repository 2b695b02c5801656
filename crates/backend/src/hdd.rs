//! Disk image arguments for the flash command

use dutlink_common::config::DisksConfig;

/// Positional `<image> <size>G` pairs for every configured disk slot.
///
/// Slots without an image are skipped; a slot without a size override
/// uses the shared default.
pub fn hdd_args(disks: &DisksConfig) -> Vec<String> {
    disks
        .images
        .iter()
        .take(disks.count)
        .filter_map(|disk| {
            let path = disk.path.as_ref()?;
            let size = disk.size_gb.unwrap_or(disks.default_size_gb);
            Some([path.display().to_string(), format!("{}G", size)])
        })
        .flatten()
        .collect()
}
