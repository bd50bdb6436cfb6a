//! Input set slicing
//!
//! Every regular file of the input directory becomes one item, keyed by its
//! file name. Files are taken in name order and grouped `batch_size` at a
//! time.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sliceloop_common::{Result, SliceLoopError};
use sliceloop_proto::Slice;
use std::path::Path;
use tracing::{debug, info};

/// Read a directory into slices of at most `batch_size` items
pub fn slice_directory(dir: &Path, batch_size: usize) -> Result<Vec<Slice>> {
    if batch_size == 0 {
        return Err(SliceLoopError::invalid_input("Batch size must be at least 1"));
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().into_string().map_err(|name| {
            SliceLoopError::invalid_input(format!("Input file name is not valid UTF-8: {:?}", name))
        })?;
        files.push((name, entry.path()));
    }
    files.sort();

    let mut slices = Vec::with_capacity(files.len().div_ceil(batch_size));
    for chunk in files.chunks(batch_size) {
        let mut slice = Slice::new();
        for (name, path) in chunk {
            let content = std::fs::read(path)?;
            debug!("Adding {} ({} bytes)", name, content.len());
            slice.insert(name.clone(), STANDARD.encode(&content));
        }
        slices.push(slice);
    }

    info!(
        "Sliced {} files from {} into {} slices",
        files.len(),
        dir.display(),
        slices.len()
    );

    Ok(slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_slice_directory_batches_in_name_order() {
        let dir = tempdir().unwrap();
        for name in ["c.png", "a.png", "b.png"] {
            std::fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let slices = slice_directory(dir.path(), 2).unwrap();

        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].item_ids().collect::<Vec<_>>(), vec!["a.png", "b.png"]);
        assert_eq!(slices[1].item_ids().collect::<Vec<_>>(), vec!["c.png"]);
        assert_eq!(slices[0].items["a.png"], STANDARD.encode("a.png"));
    }

    #[test]
    fn test_slice_directory_empty() {
        let dir = tempdir().unwrap();
        assert!(slice_directory(dir.path(), 1).unwrap().is_empty());
    }

    #[test]
    fn test_slice_directory_zero_batch() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            slice_directory(dir.path(), 0),
            Err(SliceLoopError::InvalidInput(_))
        ));
    }
}
