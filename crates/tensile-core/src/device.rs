// CpuDevice — execution context for the kernel dispatcher
//
// A device bundles everything the dispatcher needs to know about the
// machine: how many workers a fork-join split uses, the rayon pool those
// workers run on, and which accelerated kernel set (if any) handles inner
// loops. It is resolved once from a `DeviceConfig` and then handed
// explicitly to every tensor factory; each tensor carries a cheap clone.
//
//   let device = CpuDevice::new(DeviceConfig::default().with_workers(4))?;
//   let x = Tensor::<f32>::zeros((2, 3), &device);

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kernels::{Lanes16, Lanes8, ScalarKernels, VectorKernels};

/// Environment variable overriding the worker count.
pub const ENV_NUM_THREADS: &str = "TENSILE_NUM_THREADS";
/// Environment variable selecting the kernel set (`off`, `auto`, `lanes8`, `lanes16`).
pub const ENV_ACCEL: &str = "TENSILE_ACCEL";

/// Below this many output elements a kernel runs inline on the caller's
/// thread.
pub const DEFAULT_PAR_THRESHOLD: usize = 4096;

/// Which accelerated kernel set a device should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccelPreference {
    /// Probe the CPU and take the widest supported kernel set.
    #[default]
    Auto,
    /// Portable scalar loops only.
    Off,
    Lanes8,
    Lanes16,
}

impl FromStr for AccelPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AccelPreference::Auto),
            "off" | "none" | "scalar" => Ok(AccelPreference::Off),
            "lanes8" => Ok(AccelPreference::Lanes8),
            "lanes16" => Ok(AccelPreference::Lanes16),
            other => Err(Error::msg(format!("unknown accelerator preference '{other}'"))),
        }
    }
}

// Capabilities

/// What the running CPU supports, probed once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// 256-bit vector registers.
    pub lanes8: bool,
    /// 512-bit vector registers.
    pub lanes16: bool,
}

impl Capabilities {
    /// A machine with no vector support.
    pub fn none() -> Self {
        Self::default()
    }

    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        Self {
            lanes8: std::is_x86_feature_detected!("avx"),
            lanes16: std::is_x86_feature_detected!("avx512f"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        Self::none()
    }

    /// Widest kernel set this machine supports.
    pub fn best_kernels(&self) -> Arc<dyn VectorKernels> {
        if self.lanes16 {
            Arc::new(Lanes16::default())
        } else if self.lanes8 {
            Arc::new(Lanes8::default())
        } else {
            Arc::new(ScalarKernels)
        }
    }
}

// DeviceConfig

/// Builder-style configuration for a [`CpuDevice`].
#[derive(Clone)]
pub struct DeviceConfig {
    /// Fork-join width. `None` means available hardware parallelism.
    pub workers: Option<usize>,
    pub accel: AccelPreference,
    /// Explicit kernel set; takes precedence over `accel`.
    pub kernels: Option<Arc<dyn VectorKernels>>,
    pub par_threshold: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            workers: None,
            accel: AccelPreference::Auto,
            kernels: None,
            par_threshold: DEFAULT_PAR_THRESHOLD,
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("workers", &self.workers)
            .field("accel", &self.accel)
            .field("kernels", &self.kernels.as_ref().map(|k| k.name()))
            .field("par_threshold", &self.par_threshold)
            .finish()
    }
}

impl DeviceConfig {
    /// Fork-join width. Zero is rejected by [`CpuDevice::new`].
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_accel(mut self, accel: AccelPreference) -> Self {
        self.accel = accel;
        self
    }

    /// Plug in a custom kernel set.
    pub fn with_kernels(mut self, kernels: Arc<dyn VectorKernels>) -> Self {
        self.kernels = Some(kernels);
        self
    }

    pub fn with_par_threshold(mut self, threshold: usize) -> Self {
        self.par_threshold = threshold;
        self
    }

    /// Defaults overridden by `TENSILE_NUM_THREADS` and `TENSILE_ACCEL`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var(ENV_NUM_THREADS) {
            let n: usize = v
                .trim()
                .parse()
                .map_err(|_| Error::msg(format!("{ENV_NUM_THREADS}: invalid worker count '{v}'")))?;
            config = config.with_workers(n);
        }
        if let Ok(v) = std::env::var(ENV_ACCEL) {
            config = config.with_accel(v.parse()?);
        }
        Ok(config)
    }
}

// CpuDevice

struct DeviceInner {
    workers: usize,
    par_threshold: usize,
    capabilities: Capabilities,
    kernels: Arc<dyn VectorKernels>,
    pool: Option<rayon::ThreadPool>,
}

/// Resolved execution context shared by all tensors created on it.
#[derive(Clone)]
pub struct CpuDevice {
    inner: Arc<DeviceInner>,
}

impl CpuDevice {
    /// Resolve `config`: probe capabilities, pick the kernel set and build
    /// the worker pool.
    pub fn new(config: DeviceConfig) -> Result<Self> {
        let workers = config.workers.unwrap_or_else(available_workers);
        if workers == 0 {
            crate::bail!("worker count must be at least 1");
        }
        let capabilities = match config.accel {
            AccelPreference::Auto => Capabilities::detect(),
            _ => Capabilities::none(),
        };
        let kernels: Arc<dyn VectorKernels> = match (config.kernels, config.accel) {
            (Some(k), _) => k,
            (None, AccelPreference::Auto) => capabilities.best_kernels(),
            (None, AccelPreference::Off) => Arc::new(ScalarKernels),
            (None, AccelPreference::Lanes8) => Arc::new(Lanes8::default()),
            (None, AccelPreference::Lanes16) => Arc::new(Lanes16::default()),
        };
        let pool = if workers > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("tensile-worker-{i}"))
                .build()
                .map_err(|e| Error::msg(format!("failed to build worker pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        tracing::debug!(
            workers,
            kernels = kernels.name(),
            par_threshold = config.par_threshold,
            "cpu device ready"
        );
        Ok(Self {
            inner: Arc::new(DeviceInner {
                workers,
                par_threshold: config.par_threshold,
                capabilities,
                kernels,
                pool,
            }),
        })
    }

    /// Single worker, scalar kernels. Never fails.
    pub fn serial() -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                workers: 1,
                par_threshold: DEFAULT_PAR_THRESHOLD,
                capabilities: Capabilities::none(),
                kernels: Arc::new(ScalarKernels),
                pool: None,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn par_threshold(&self) -> usize {
        self.inner.par_threshold
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.capabilities
    }

    pub fn kernels(&self) -> &dyn VectorKernels {
        self.inner.kernels.as_ref()
    }

    /// Whether two handles refer to the same resolved device.
    pub fn same_device(&self, other: &CpuDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `f` inside this device's worker pool; rayon parallel iterators
    /// started from `f` use the pool's threads.
    pub(crate) fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.inner.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

impl Default for CpuDevice {
    /// Defaults from the environment, falling back to a serial device when
    /// the environment is malformed or the pool cannot be built.
    fn default() -> Self {
        match DeviceConfig::from_env().and_then(CpuDevice::new) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!(error = %e, "falling back to serial cpu device");
                CpuDevice::serial()
            }
        }
    }
}

impl fmt::Debug for CpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuDevice")
            .field("workers", &self.inner.workers)
            .field("kernels", &self.inner.kernels.name())
            .finish()
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
