use anyhow::{Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

/// One more than the highest `image_<n>.png` in `dir`, starting at 1.
pub fn next_image_number(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 1;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            name.strip_prefix("image_")?.strip_suffix(".png")?.parse::<u64>().ok()
        })
        .max()
        .map_or(1, |n| n + 1)
}

pub fn save_frame(dir: &Path, frame: &RgbImage) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("image_{}.png", next_image_number(dir)));
    frame
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
