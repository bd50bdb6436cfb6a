//! Model publishing
//!
//! Turns a model descriptor and its artifacts into an attached module
//! (`module.json`) plus a package descriptor (`package.json`) that jobs can
//! reference by name and version.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sliceloop_common::{Result, SliceLoopError};
use sliceloop_proto::{AttachedModule, ModelDescriptor, PackageDescriptor};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the attached module inside a published package
pub const MODULE_FILE: &str = "module.json";

/// File name of the package descriptor
pub const PACKAGE_FILE: &str = "package.json";

/// Read a model descriptor; returns it with the directory its artifact names
/// are relative to
pub fn load_descriptor(path: &Path) -> Result<(ModelDescriptor, PathBuf)> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SliceLoopError::config(format!("Failed to read model descriptor {}: {}", path.display(), e)))?;
    let descriptor: ModelDescriptor = serde_json::from_str(&content)?;
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((descriptor, base))
}

/// Build the attached module for a descriptor whose artifacts live in `base`
pub fn build_module(descriptor: &ModelDescriptor, base: &Path) -> Result<AttachedModule> {
    let read = |name: &str| {
        std::fs::read(base.join(name))
            .map_err(|e| SliceLoopError::model(format!("Failed to read {}: {}", base.join(name).display(), e)))
    };

    Ok(AttachedModule {
        model: STANDARD.encode(read(&descriptor.model)?),
        preprocess: STANDARD.encode(read(&descriptor.preprocess)?),
        postprocess: STANDARD.encode(read(&descriptor.postprocess)?),
        packages: descriptor.packages.clone(),
    })
}

/// Package descriptor listing the module file
pub fn package_descriptor(descriptor: &ModelDescriptor) -> PackageDescriptor {
    let mut files = BTreeMap::new();
    files.insert(MODULE_FILE.to_string(), MODULE_FILE.to_string());

    PackageDescriptor {
        name: descriptor.name.clone(),
        version: descriptor.version.clone(),
        files,
    }
}

/// Publish a model into `out_dir`; returns the package descriptor path
pub fn publish(descriptor: &ModelDescriptor, base: &Path, out_dir: &Path) -> Result<PathBuf> {
    let module = build_module(descriptor, base)?;
    let package = package_descriptor(descriptor);

    std::fs::create_dir_all(out_dir)?;
    std::fs::write(out_dir.join(MODULE_FILE), serde_json::to_vec_pretty(&module)?)?;

    let package_path = out_dir.join(PACKAGE_FILE);
    std::fs::write(&package_path, serde_json::to_vec_pretty(&package)?)?;

    info!(
        "Published {} {} to {}",
        package.name,
        package.version,
        out_dir.display()
    );

    Ok(package_path)
}

/// Load a published module by package descriptor path
pub fn load_published(package_path: &Path) -> Result<AttachedModule> {
    let package: PackageDescriptor = serde_json::from_slice(&std::fs::read(package_path)?)?;
    let dir = package_path.parent().unwrap_or_else(|| Path::new("."));

    let module_file = package
        .files
        .get(MODULE_FILE)
        .ok_or_else(|| SliceLoopError::not_found(format!("{} in package {}", MODULE_FILE, package.name)))?;

    Ok(serde_json::from_slice(&std::fs::read(dir.join(module_file))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sliceloop_worker::ModelPackage;
    use sliceloop_proto::WorkArgs;
    use tempfile::tempdir;

    fn write_model(dir: &Path) -> PathBuf {
        std::fs::write(dir.join("mnist.onnx"), [8u8, 1, 2]).unwrap();
        std::fs::write(dir.join("pre.py"), "def preprocess(d, n): ...\n").unwrap();
        std::fs::write(dir.join("post.py"), "def postprocess(o, l, n): ...\n").unwrap();
        let path = dir.join("model.json");
        std::fs::write(
            &path,
            r#"{"name": "mnist", "version": "1.2.0", "model": "mnist.onnx",
                "preprocess": "pre.py", "postprocess": "post.py", "packages": ["numpy"]}"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn test_publish_round_trip() {
        let src = tempdir().unwrap();
        let out = tempdir().unwrap();
        let (descriptor, base) = load_descriptor(&write_model(src.path())).unwrap();

        let package_path = publish(&descriptor, &base, out.path()).unwrap();
        let module = load_published(&package_path).unwrap();

        let package = ModelPackage::resolve(&WorkArgs::default(), Some(&module)).unwrap();
        assert_eq!(package.model, vec![8, 1, 2]);
        assert_eq!(package.preprocess, "def preprocess(d, n): ...\n");
        assert_eq!(package.packages, vec!["numpy".to_string()]);
    }

    #[test]
    fn test_package_descriptor() {
        let src = tempdir().unwrap();
        let (descriptor, _) = load_descriptor(&write_model(src.path())).unwrap();

        let package = package_descriptor(&descriptor);

        assert_eq!(package.name, "mnist");
        assert_eq!(package.version, "1.2.0");
        assert_eq!(package.files.get(MODULE_FILE).map(String::as_str), Some(MODULE_FILE));
    }

    #[test]
    fn test_missing_artifact() {
        let src = tempdir().unwrap();
        let path = write_model(src.path());
        std::fs::remove_file(src.path().join("post.py")).unwrap();
        let (descriptor, base) = load_descriptor(&path).unwrap();

        assert!(matches!(build_module(&descriptor, &base), Err(SliceLoopError::Model(_))));
    }
}
