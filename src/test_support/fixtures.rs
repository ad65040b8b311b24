//! Configuration fixtures shared by unit tests.

use std::path::{Path, PathBuf};

/// A config exercising every section.
pub const LOADER_CONFIG: &str = r#"
[loader]
force_intercept = false

[[loader.adapters]]
name = "level_zero"
paths = ["/opt/l0/libunimem_adapter_l0.so", "libunimem_adapter_l0.so"]

[[loader.adapters]]
name = "cuda"
paths = ["/usr/local/cuda/lib64/libunimem_adapter_cuda.so"]

[[providers]]
tag = "host"

[[providers]]
tag = "adapter:level_zero"
device = "Arc A770"
"#;

/// Write `contents` to `dir/name` and return the path.
pub fn write_config(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
