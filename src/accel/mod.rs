//! Acceleration dispatcher
//!
//! Backends are discovered once at startup into an explicit [`Capabilities`]
//! set. The [`Dispatcher`] then encrypts or decrypts chunks with the caller's
//! preferred backend, falling back through [`PRIORITY`] to software AES.

#[cfg(feature = "openssl")]
mod cpu;
mod dispatcher;
mod library;
mod software;

pub use dispatcher::{CipherBackend, Dispatcher};
pub use library::LibraryBackend;
pub use software::SoftwareBackend;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// AES implementation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// External CUDA accelerator library
    CudaGpu,
    /// External OpenCL accelerator library
    OpenClGpu,
    /// OpenSSL EVP on a CPU with AES instructions
    CpuAccelerated,
    /// Pure-Rust AES, always available
    Software,
}

/// Fixed fallback order, software last
pub const PRIORITY: [BackendKind; 4] = [
    BackendKind::CudaGpu,
    BackendKind::OpenClGpu,
    BackendKind::CpuAccelerated,
    BackendKind::Software,
];

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::CudaGpu => "cuda-gpu",
            BackendKind::OpenClGpu => "opencl-gpu",
            BackendKind::CpuAccelerated => "cpu-accelerated",
            BackendKind::Software => "software",
        }
    }

    /// This backend followed by every lower-priority backend
    pub fn fallback_chain(self) -> impl Iterator<Item = BackendKind> {
        PRIORITY.into_iter().skip_while(move |k| *k != self)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cuda-gpu" | "cuda" => Ok(BackendKind::CudaGpu),
            "opencl-gpu" | "opencl" => Ok(BackendKind::OpenClGpu),
            "cpu-accelerated" | "cpu" | "aesni" => Ok(BackendKind::CpuAccelerated),
            "software" | "soft" => Ok(BackendKind::Software),
            other => Err(Error::InvalidConfig(format!("unknown backend '{}'", other))),
        }
    }
}

/// Set of backends usable in this process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    available: BTreeSet<BackendKind>,
}

impl Capabilities {
    pub fn from_kinds(kinds: impl IntoIterator<Item = BackendKind>) -> Self {
        let mut available: BTreeSet<BackendKind> = kinds.into_iter().collect();
        available.insert(BackendKind::Software);
        Capabilities { available }
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.available.contains(&kind)
    }

    /// Available backends in priority order
    pub fn iter(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.available.iter().copied()
    }

    /// Best available backend
    pub fn best(&self) -> BackendKind {
        self.iter().next().unwrap_or(BackendKind::Software)
    }
}

/// Whether the CPU reports AES instructions
pub fn cpu_has_aes() -> bool {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        std::is_x86_feature_detected!("aes")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("aes")
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ends_with_software() {
        assert_eq!(PRIORITY.last(), Some(&BackendKind::Software));
        let mut sorted = PRIORITY.to_vec();
        sorted.sort();
        assert_eq!(sorted, PRIORITY.to_vec());
    }

    #[test]
    fn test_fallback_chain() {
        let chain: Vec<_> = BackendKind::OpenClGpu.fallback_chain().collect();
        assert_eq!(
            chain,
            vec![BackendKind::OpenClGpu, BackendKind::CpuAccelerated, BackendKind::Software]
        );
        let chain: Vec<_> = BackendKind::Software.fallback_chain().collect();
        assert_eq!(chain, vec![BackendKind::Software]);
    }

    #[test]
    fn test_parse_and_display() {
        for kind in PRIORITY {
            assert_eq!(kind.to_string().parse::<BackendKind>().unwrap(), kind);
        }
        assert_eq!("AESNI".parse::<BackendKind>().unwrap(), BackendKind::CpuAccelerated);
        assert!("quantum".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&BackendKind::OpenClGpu).unwrap();
        assert_eq!(json, "\"opencl-gpu\"");
    }

    #[test]
    fn test_capabilities_always_include_software() {
        let caps = Capabilities::from_kinds([BackendKind::OpenClGpu]);
        assert!(caps.contains(BackendKind::Software));
        assert_eq!(caps.best(), BackendKind::OpenClGpu);
        assert_eq!(
            caps.iter().collect::<Vec<_>>(),
            vec![BackendKind::OpenClGpu, BackendKind::Software]
        );
    }
}
