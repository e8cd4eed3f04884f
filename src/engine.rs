//! Engine context, worker pool, and the two-phase iteration scheduler.
//!
//! One iteration is a filter pass followed by an update pass over every Z
//! slice. All threads (the caller is worker 0) rendezvous on two reusable
//! barriers between the passes; within a pass, slices are handed out
//! dynamically through a single mutex-protected counter. The barrier between
//! filtering and updating is the load-bearing correctness mechanism: no
//! thread may fold a delta into a current value while any thread can still
//! read current values for this iteration's kernels. That separation makes
//! the result independent of thread count and slice assignment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::buffer::{GridDims, VolumeBuffer};
use crate::error::{CapabilityWarning, ConfigError, DiffusionError, ResourceError};
use crate::float_trait::DiffusionFloat;
use crate::method::{kernel_for, update_for, KernelFn, Kind, Method, UpdateFn, MAX_PARAMETERS};
use crate::neighborhood::{cache_len, select_fill, FillFn, Neighborhood, StencilScales};
use crate::volume::Volume;

// =============================================================================
// Configuration
// =============================================================================

/// Engine configuration, fixed for a context once `configure` succeeds.
#[derive(Debug, Clone)]
pub struct DiffusionConfig {
    /// Per-voxel value layout; must match the input volume's axis count.
    pub kind: Kind,
    /// Numerical scheme to run.
    pub method: Method,
    /// Neighborhood half-width in voxels.
    pub radius: usize,
    /// Worker threads including the calling thread. Clamped to the Z extent.
    pub num_threads: usize,
    /// Emit progress lines at info level.
    pub verbose: bool,
    /// Method parameters; exactly `method.num_parameters()` values.
    pub parameters: Vec<f64>,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            kind: Kind::Scalar,
            method: Method::Testing,
            radius: 1,
            num_threads: 1,
            verbose: false,
            parameters: Vec::new(),
        }
    }
}

impl DiffusionConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radius < 1 {
            return Err(ConfigError::Radius(self.radius));
        }
        if self.num_threads < 1 {
            return Err(ConfigError::Threads(self.num_threads));
        }
        if kernel_for::<f64>(self.kind, self.method).is_none() {
            return Err(ConfigError::UnsupportedMethod {
                kind: self.kind,
                method: self.method,
            });
        }
        let expected = self.method.num_parameters();
        if self.parameters.len() != expected {
            return Err(ConfigError::ParameterCount {
                method: self.method,
                expected,
                actual: self.parameters.len(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Shared pool state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Filter,
    Update,
}

/// Slice hand-out state. `next == sz` with a phase's todo flag set means the
/// phase has not begun; the first claimer resets the counter. When the
/// counter reaches the extent, the *other* phase is armed for the next round.
struct SliceClaim {
    next: usize,
    filter_todo: bool,
    update_todo: bool,
}

/// One-shot rendezvous between `start` and the spawned workers. Workers park
/// here until the root thread has either spawned the whole pool (go) or hit
/// a spawn failure (abort), so the barriers only ever see a full complement.
struct StartGate {
    go: Mutex<Option<bool>>,
    signal: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            go: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    fn wait(&self) -> bool {
        let mut go = self.go.lock().unwrap_or_else(PoisonError::into_inner);
        while go.is_none() {
            go = self
                .signal
                .wait(go)
                .unwrap_or_else(PoisonError::into_inner);
        }
        go.unwrap_or(false)
    }

    fn open(&self, proceed: bool) {
        let mut go = self.go.lock().unwrap_or_else(PoisonError::into_inner);
        *go = Some(proceed);
        self.signal.notify_all();
    }
}

/// State shared by every worker, root thread included.
struct Shared<F: DiffusionFloat> {
    buffer: VolumeBuffer<F>,
    radius: usize,
    scales: StencilScales<F>,
    parameters: [F; MAX_PARAMETERS],
    kernel: KernelFn<F>,
    update: UpdateFn<F>,
    claim: Mutex<SliceClaim>,
    filter_barrier: Barrier,
    update_barrier: Barrier,
    finished: AtomicBool,
    gate: StartGate,
}

/// Claim the next unprocessed slice for `phase`, or the Z extent as a
/// sentinel when the phase is exhausted. One brief lock per claim; no lock
/// is held while a slice is processed.
fn claim_next_slice<F: DiffusionFloat>(shared: &Shared<F>, phase: Phase) -> usize {
    let sz = shared.buffer.dims().sz;
    let mut state = shared
        .claim
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let todo = match phase {
        Phase::Filter => state.filter_todo,
        Phase::Update => state.update_todo,
    };
    if state.next == sz && todo {
        match phase {
            Phase::Filter => state.filter_todo = false,
            Phase::Update => state.update_todo = false,
        }
        state.next = 0;
    }

    let this_z = state.next;
    if this_z < sz {
        state.next += 1;
        if state.next == sz {
            match phase {
                Phase::Filter => state.update_todo = true,
                Phase::Update => state.filter_todo = true,
            }
        }
    }
    this_z
}

// =============================================================================
// Worker tasks
// =============================================================================

/// Per-thread state: the private neighborhood cache and the fill strategy
/// chosen for this context's `(radius, val_len)`.
struct WorkerTask<F> {
    index: usize,
    cache: Vec<F>,
    fill: FillFn<F>,
}

impl<F: DiffusionFloat> WorkerTask<F> {
    fn new(index: usize, radius: usize, val_len: usize) -> Self {
        Self {
            index,
            cache: vec![F::zero(); cache_len(radius, val_len)],
            fill: select_fill(radius, val_len),
        }
    }
}

fn run_filter_phase<F: DiffusionFloat>(shared: &Shared<F>, task: &mut WorkerTask<F>) {
    let dims = shared.buffer.dims();
    let vl = shared.buffer.val_len();
    loop {
        let z = claim_next_slice(shared, Phase::Filter);
        if z == dims.sz {
            break;
        }
        for y in 0..dims.sy {
            for x in 0..dims.sx {
                (task.fill)(&mut task.cache, &shared.buffer, shared.radius, x, y, z);
                let neigh = Neighborhood::new(&task.cache, shared.radius, vl);
                let base = shared.buffer.voxel_base(x, y, z);
                // SAFETY: slice z is owned by this thread for this phase, and
                // filtering writes only delta halves.
                let delta = unsafe { shared.buffer.range_mut(base + vl, vl) };
                (shared.kernel)(&neigh, &shared.scales, &shared.parameters, delta);
            }
        }
    }
}

fn run_update_phase<F: DiffusionFloat>(shared: &Shared<F>) {
    let dims = shared.buffer.dims();
    let vl = shared.buffer.val_len();
    loop {
        let z = claim_next_slice(shared, Phase::Update);
        if z == dims.sz {
            break;
        }
        for y in 0..dims.sy {
            for x in 0..dims.sx {
                let base = shared.buffer.voxel_base(x, y, z);
                // SAFETY: slice z is owned by this thread for this phase;
                // both halves of its voxels are private here.
                let voxel = unsafe { shared.buffer.range_mut(base, 2 * vl) };
                let (current, delta) = voxel.split_at_mut(vl);
                (shared.update)(current, delta);
            }
        }
    }
}

/// Main loop of a spawned worker. The finished flag is checked right after
/// the filter barrier releases; that is the only exit point.
fn worker_main<F: DiffusionFloat>(shared: Arc<Shared<F>>, mut task: WorkerTask<F>) {
    if !shared.gate.wait() {
        return;
    }
    loop {
        shared.filter_barrier.wait();
        if shared.finished.load(Ordering::Acquire) {
            log::debug!("worker {} exiting", task.index);
            return;
        }
        run_filter_phase(&shared, &mut task);
        shared.update_barrier.wait();
        run_update_phase(&shared);
    }
}

// =============================================================================
// Context
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Empty,
    Configured,
    Running,
    Done,
}

/// The diffusion engine: configuration, double-buffered volume, and worker
/// pool, driven through `configure` → `start` → `iterate` → `finish` →
/// `output`.
pub struct DiffusionContext<F: DiffusionFloat> {
    stage: Stage,
    shared: Option<Arc<Shared<F>>>,
    root_task: Option<WorkerTask<F>>,
    workers: Vec<JoinHandle<()>>,
    effective_threads: usize,
    warnings: Vec<CapabilityWarning>,
    spacing: [Option<f64>; 3],
    verbose: bool,
}

impl<F: DiffusionFloat> Default for DiffusionContext<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: DiffusionFloat> DiffusionContext<F> {
    /// An unconfigured context.
    pub fn new() -> Self {
        Self {
            stage: Stage::Empty,
            shared: None,
            root_task: None,
            workers: Vec::new(),
            effective_threads: 1,
            warnings: Vec::new(),
            spacing: [None; 3],
            verbose: false,
        }
    }

    /// Validate the configuration against the input, allocate the double
    /// buffer, and load the input into the current halves.
    ///
    /// On any failure the context is left exactly as it was.
    pub fn configure(
        &mut self,
        input: &Volume<F>,
        config: &DiffusionConfig,
    ) -> Result<(), DiffusionError> {
        if self.stage == Stage::Running {
            return Err(ConfigError::AlreadyRunning.into());
        }
        config.validate()?;
        let kernel = kernel_for::<F>(config.kind, config.method).ok_or(
            ConfigError::UnsupportedMethod {
                kind: config.kind,
                method: config.method,
            },
        )?;
        if input.kind() != config.kind {
            return Err(ConfigError::AxisCount {
                kind: config.kind,
                expected: config.kind.num_axes(),
                actual: input.shape().len(),
            }
            .into());
        }
        let (spacing, assumed_unit) = input.derive_spacing()?;

        let [sx, sy, sz] = input.spatial_shape();
        let dims = GridDims { sx, sy, sz };
        let val_len = config.kind.val_len();

        let mut warnings = Vec::new();
        if assumed_unit {
            warnings.push(CapabilityWarning::UnitSpacingAssumed);
        }
        let mut threads = config.num_threads;
        if threads > dims.sz {
            warnings.push(CapabilityWarning::ThreadsClamped {
                requested: threads,
                clamped: dims.sz,
            });
            threads = dims.sz;
        }

        let mut buffer = VolumeBuffer::new(dims, val_len)?;
        buffer.copy_in(input);

        // All validation has passed; commit.
        for warning in &warnings {
            log::warn!("{warning}");
        }
        let mut parameters = [F::zero(); MAX_PARAMETERS];
        for (slot, &value) in parameters.iter_mut().zip(config.parameters.iter()) {
            *slot = F::from_f64_c(value);
        }

        self.shared = Some(Arc::new(Shared {
            buffer,
            radius: config.radius,
            scales: StencilScales::from_spacing(spacing),
            parameters,
            kernel,
            update: update_for(config.kind),
            claim: Mutex::new(SliceClaim {
                next: dims.sz,
                filter_todo: true,
                update_todo: false,
            }),
            filter_barrier: Barrier::new(threads),
            update_barrier: Barrier::new(threads),
            finished: AtomicBool::new(false),
            gate: StartGate::new(),
        }));
        self.stage = Stage::Configured;
        self.root_task = None;
        self.workers = Vec::new();
        self.effective_threads = threads;
        self.warnings = warnings;
        self.spacing = input.spacing();
        self.verbose = config.verbose;
        if self.verbose {
            log::info!(
                "configured {}x{}x{} volume, {} value component(s), radius {}, {} thread(s)",
                sx,
                sy,
                sz,
                val_len,
                config.radius,
                threads
            );
        }
        Ok(())
    }

    /// Spawn the worker pool. The calling thread becomes worker 0.
    pub fn start(&mut self) -> Result<(), DiffusionError> {
        match self.stage {
            Stage::Empty => return Err(ConfigError::NotConfigured.into()),
            Stage::Running => return Err(ConfigError::AlreadyRunning.into()),
            Stage::Done => return Err(ConfigError::PoolExhausted.into()),
            Stage::Configured => {}
        }
        let shared = match self.shared.as_ref() {
            Some(shared) => Arc::clone(shared),
            None => return Err(ConfigError::NotConfigured.into()),
        };
        let radius = shared.radius;
        let val_len = shared.buffer.val_len();

        self.root_task = Some(WorkerTask::new(0, radius, val_len));
        let mut workers = Vec::with_capacity(self.effective_threads - 1);
        for index in 1..self.effective_threads {
            let worker_shared = Arc::clone(&shared);
            let task = WorkerTask::new(index, radius, val_len);
            let spawned = std::thread::Builder::new()
                .name(format!("diffusion-worker-{index}"))
                .spawn(move || worker_main(worker_shared, task));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    // Release the partial pool before it ever reaches a
                    // barrier, then join it off.
                    shared.gate.open(false);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    self.root_task = None;
                    return Err(ResourceError::ThreadSpawn { index, source }.into());
                }
            }
        }
        shared.gate.open(true);
        self.workers = workers;
        self.stage = Stage::Running;
        if self.verbose {
            log::info!("worker pool started with {} thread(s)", self.effective_threads);
        }
        Ok(())
    }

    /// Run `iterations` full filter + update cycles. Root thread only; the
    /// pool parks at the filter barrier between calls.
    pub fn iterate(&mut self, iterations: usize) -> Result<(), DiffusionError> {
        if self.stage != Stage::Running {
            return Err(ConfigError::NotRunning.into());
        }
        let shared = match self.shared.as_ref() {
            Some(shared) => Arc::clone(shared),
            None => return Err(ConfigError::NotRunning.into()),
        };
        let task = match self.root_task.as_mut() {
            Some(task) => task,
            None => return Err(ConfigError::NotRunning.into()),
        };
        for iteration in 0..iterations {
            if self.verbose {
                log::info!("iteration {}/{}", iteration + 1, iterations);
            }
            shared.filter_barrier.wait();
            run_filter_phase(&shared, task);
            shared.update_barrier.wait();
            run_update_phase(&shared);
        }
        Ok(())
    }

    /// Signal shutdown, release the pool, and join every worker.
    pub fn finish(&mut self) -> Result<(), DiffusionError> {
        if self.stage != Stage::Running {
            return Err(ConfigError::NotRunning.into());
        }
        if let Some(shared) = self.shared.as_ref() {
            shared.finished.store(true, Ordering::Release);
            shared.filter_barrier.wait();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("a worker thread panicked during shutdown");
            }
        }
        self.root_task = None;
        self.stage = Stage::Done;
        if self.verbose {
            log::info!("worker pool finished");
        }
        Ok(())
    }

    /// Copy of the current half of the volume, shaped and annotated like the
    /// input. Always the engine's working float type, never re-quantized.
    pub fn output(&self) -> Result<Volume<F>, DiffusionError> {
        let shared = self
            .shared
            .as_ref()
            .ok_or(ConfigError::NotConfigured)?;
        // The pool, if running, is parked at the filter barrier here, so the
        // buffer has no concurrent writers.
        let data = shared.buffer.copy_out();
        Ok(Volume::with_spacing(data, self.spacing)?)
    }

    /// Thread count after clamping against the Z extent.
    pub fn effective_threads(&self) -> usize {
        self.effective_threads
    }

    /// Capability warnings recorded by the last successful `configure`.
    pub fn warnings(&self) -> &[CapabilityWarning] {
        &self.warnings
    }
}

impl<F: DiffusionFloat> Drop for DiffusionContext<F> {
    fn drop(&mut self) {
        if self.stage == Stage::Running {
            let _ = self.finish();
        }
    }
}

// =============================================================================
// One-shot entry point
// =============================================================================

/// Run the whole lifecycle in one call: configure, start, iterate, finish,
/// and return the filtered volume.
pub fn diffuse<F: DiffusionFloat>(
    input: &Volume<F>,
    config: &DiffusionConfig,
    iterations: usize,
) -> Result<Volume<F>, DiffusionError> {
    let mut context = DiffusionContext::new();
    context.configure(input, config)?;
    context.start()?;
    context.iterate(iterations)?;
    context.finish()?;
    context.output()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    // Helper: simple LCG for deterministic test data
    struct SimpleLcg {
        state: u64,
    }

    impl SimpleLcg {
        fn new(seed: u64) -> Self {
            Self { state: seed }
        }

        fn next_f64(&mut self) -> f64 {
            self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (self.state >> 40) as f64 / (1u64 << 24) as f64
        }
    }

    fn scalar_volume(shape: [usize; 3], f: impl Fn(usize, usize, usize) -> f64) -> Volume<f64> {
        let data = ArrayD::from_shape_fn(IxDyn(&shape), |ix| f(ix[0], ix[1], ix[2]));
        Volume::new(data).unwrap()
    }

    fn random_scalar_volume(shape: [usize; 3], seed: u64) -> Volume<f64> {
        let mut rng = SimpleLcg::new(seed);
        let data = ArrayD::from_shape_fn(IxDyn(&shape), |_| rng.next_f64());
        Volume::new(data).unwrap()
    }

    fn config(method: Method, parameters: &[f64]) -> DiffusionConfig {
        DiffusionConfig {
            method,
            parameters: parameters.to_vec(),
            ..DiffusionConfig::default()
        }
    }

    fn max_abs_diff(a: &Volume<f64>, b: &Volume<f64>) -> f64 {
        a.data()
            .iter()
            .zip(b.data().iter())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f64::max)
    }

    // ==================== Concrete scenarios ====================

    #[test]
    fn test_scenario_a_constant_field_unchanged() {
        let input = scalar_volume([3, 3, 3], |_, _, _| 1.0);
        let out = diffuse(&input, &config(Method::Homogeneous, &[0.1]), 3).unwrap();
        for &v in out.data().iter() {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_scenario_b_impulse_spreads_one_step() {
        let input = scalar_volume([5, 5, 5], |x, y, z| {
            if (x, y, z) == (2, 2, 2) {
                100.0
            } else {
                0.0
            }
        });
        let out = diffuse(&input, &config(Method::Homogeneous, &[0.1]), 1).unwrap();
        let d = out.data();
        // Face neighbors gain 0.1 * 100.
        for ix in [
            [1, 2, 2],
            [3, 2, 2],
            [2, 1, 2],
            [2, 3, 2],
            [2, 2, 1],
            [2, 2, 3],
        ] {
            assert!((d[IxDyn(&ix)] - 10.0).abs() < 1e-12);
        }
        // Center loses 6 * 10.
        assert!((d[IxDyn(&[2, 2, 2])] - 40.0).abs() < 1e-12);
        // Diagonal neighbors are untouched after one step.
        assert!(d[IxDyn(&[1, 1, 2])].abs() < 1e-12);
        assert!(d[IxDyn(&[0, 0, 0])].abs() < 1e-12);
    }

    #[test]
    fn test_scenario_c_thread_clamp() {
        let input = random_scalar_volume([6, 5, 4], 7);
        let mut cfg = config(Method::Homogeneous, &[0.1]);
        cfg.num_threads = 10;
        let mut ctx = DiffusionContext::new();
        ctx.configure(&input, &cfg).unwrap();
        assert_eq!(ctx.effective_threads(), 4);
        assert!(ctx.warnings().contains(&CapabilityWarning::ThreadsClamped {
            requested: 10,
            clamped: 4
        }));
        ctx.start().unwrap();
        ctx.iterate(1).unwrap();
        ctx.finish().unwrap();
    }

    #[test]
    fn test_scenario_d_unsupported_combination() {
        let data = ArrayD::<f64>::zeros(IxDyn(&[7, 3, 3, 3]));
        let input = Volume::new(data).unwrap();
        let mut cfg = config(Method::PeronaMalik, &[0.1, 1.0]);
        cfg.kind = Kind::Tensor;
        let mut ctx = DiffusionContext::new();
        let err = ctx.configure(&input, &cfg).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("perona-malik"));
        assert!(msg.contains("tensor"));
        // Context stays unconfigured.
        assert!(matches!(
            ctx.output().unwrap_err(),
            DiffusionError::Config(ConfigError::NotConfigured)
        ));
    }

    // ==================== Testable properties ====================

    #[test]
    fn test_output_preserves_shape_and_spacing() {
        let data = ArrayD::<f64>::zeros(IxDyn(&[4, 5, 6]));
        let input = Volume::with_spacing(data, [Some(0.5), Some(1.0), Some(2.0)]).unwrap();
        let out = diffuse(&input, &config(Method::Testing, &[]), 2).unwrap();
        assert_eq!(out.shape(), input.shape());
        assert_eq!(out.spacing(), input.spacing());
    }

    #[test]
    fn test_zero_timestep_idempotence() {
        let input = random_scalar_volume([5, 4, 6], 11);
        let out = diffuse(&input, &config(Method::Homogeneous, &[0.0]), 5).unwrap();
        assert_eq!(max_abs_diff(&input, &out), 0.0);
    }

    #[test]
    fn test_testing_method_is_identity() {
        let input = random_scalar_volume([4, 4, 4], 23);
        let out = diffuse(&input, &config(Method::Testing, &[]), 3).unwrap();
        assert_eq!(max_abs_diff(&input, &out), 0.0);
    }

    #[test]
    fn test_thread_count_determinism() {
        let input = random_scalar_volume([8, 7, 6], 99);
        let single = diffuse(&input, &config(Method::PeronaMalik, &[0.15, 2.0]), 5).unwrap();
        let mut cfg = config(Method::PeronaMalik, &[0.15, 2.0]);
        cfg.num_threads = 4;
        let multi = diffuse(&input, &cfg, 5).unwrap();
        assert!(max_abs_diff(&single, &multi) < 1e-12);
    }

    #[test]
    fn test_radius_does_not_change_kernel_support() {
        // The shipped kernels only read offsets in [-1, 1]; a larger cache
        // radius must not change the numbers, only the fill path.
        let input = random_scalar_volume([6, 6, 6], 5);
        let r1 = diffuse(&input, &config(Method::Homogeneous, &[0.2]), 3).unwrap();
        let mut cfg = config(Method::Homogeneous, &[0.2]);
        cfg.radius = 2;
        let r2 = diffuse(&input, &cfg, 3).unwrap();
        assert!(max_abs_diff(&r1, &r2) < 1e-12);
    }

    #[test]
    fn test_multiple_iterate_calls_compose() {
        let input = random_scalar_volume([5, 5, 5], 13);
        let once = diffuse(&input, &config(Method::Homogeneous, &[0.1]), 4).unwrap();

        let mut ctx = DiffusionContext::new();
        ctx.configure(&input, &config(Method::Homogeneous, &[0.1]))
            .unwrap();
        ctx.start().unwrap();
        ctx.iterate(1).unwrap();
        ctx.iterate(3).unwrap();
        ctx.finish().unwrap();
        let split = ctx.output().unwrap();

        assert!(max_abs_diff(&once, &split) < 1e-12);
    }

    #[test]
    fn test_smoothing_reduces_variance() {
        let input = random_scalar_volume([8, 8, 8], 321);
        let out = diffuse(&input, &config(Method::Homogeneous, &[0.15]), 10).unwrap();

        let variance = |v: &Volume<f64>| {
            let n = v.data().len() as f64;
            let mean = v.data().iter().sum::<f64>() / n;
            v.data().iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
        };
        assert!(variance(&out) < variance(&input));
    }

    // ==================== Tensor runs ====================

    fn random_tensor_volume(shape: [usize; 3], seed: u64) -> Volume<f64> {
        let mut rng = SimpleLcg::new(seed);
        let full = [7, shape[0], shape[1], shape[2]];
        let data = ArrayD::from_shape_fn(IxDyn(&full), |ix| {
            if ix[0] == 0 {
                1.0
            } else {
                rng.next_f64()
            }
        });
        Volume::new(data).unwrap()
    }

    #[test]
    fn test_tensor_homogeneous_confidence_unchanged() {
        let input = random_tensor_volume([4, 4, 5], 55);
        let mut cfg = config(Method::Homogeneous, &[0.05]);
        cfg.kind = Kind::Tensor;
        cfg.num_threads = 2;
        let out = diffuse(&input, &cfg, 3).unwrap();
        assert_eq!(out.shape(), input.shape());
        let d = out.data();
        for x in 0..4 {
            for y in 0..4 {
                for z in 0..5 {
                    assert_eq!(d[IxDyn(&[0, x, y, z])], 1.0);
                }
            }
        }
    }

    #[test]
    fn test_tensor_self_runs() {
        let input = random_tensor_volume([3, 3, 4], 77);
        let mut cfg = config(Method::TensorSelf, &[0.02]);
        cfg.kind = Kind::Tensor;
        let out = diffuse(&input, &cfg, 2).unwrap();
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_tensor_finish_runs() {
        let input = random_tensor_volume([3, 4, 3], 88);
        let mut cfg = config(Method::TensorFinish, &[0.05, 1.0, 1.0, 1.0]);
        cfg.kind = Kind::Tensor;
        let out = diffuse(&input, &cfg, 2).unwrap();
        assert!(out.data().iter().all(|v| v.is_finite()));
    }

    // ==================== Validation & lifecycle ====================

    #[test]
    fn test_parameter_count_mismatch() {
        let input = random_scalar_volume([3, 3, 3], 1);
        let mut ctx = DiffusionContext::new();
        let err = ctx
            .configure(&input, &config(Method::PeronaMalik, &[0.1]))
            .unwrap_err();
        assert!(matches!(
            err,
            DiffusionError::Config(ConfigError::ParameterCount {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_radius_and_threads() {
        let mut cfg = config(Method::Testing, &[]);
        cfg.radius = 0;
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::Radius(0));
        cfg.radius = 1;
        cfg.num_threads = 0;
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::Threads(0));
    }

    #[test]
    fn test_kind_axis_mismatch() {
        let input = random_scalar_volume([3, 3, 3], 2);
        let mut cfg = config(Method::Homogeneous, &[0.1]);
        cfg.kind = Kind::Tensor;
        let mut ctx = DiffusionContext::new();
        assert!(matches!(
            ctx.configure(&input, &cfg).unwrap_err(),
            DiffusionError::Config(ConfigError::AxisCount { .. })
        ));
    }

    #[test]
    fn test_lifecycle_misuse() {
        let input = random_scalar_volume([3, 3, 3], 3);
        let mut ctx = DiffusionContext::new();

        assert!(matches!(
            ctx.start().unwrap_err(),
            DiffusionError::Config(ConfigError::NotConfigured)
        ));
        assert!(matches!(
            ctx.iterate(1).unwrap_err(),
            DiffusionError::Config(ConfigError::NotRunning)
        ));

        ctx.configure(&input, &config(Method::Testing, &[])).unwrap();
        ctx.start().unwrap();
        assert!(matches!(
            ctx.start().unwrap_err(),
            DiffusionError::Config(ConfigError::AlreadyRunning)
        ));
        assert!(matches!(
            ctx.configure(&input, &config(Method::Testing, &[]))
                .unwrap_err(),
            DiffusionError::Config(ConfigError::AlreadyRunning)
        ));

        ctx.finish().unwrap();
        assert!(matches!(
            ctx.finish().unwrap_err(),
            DiffusionError::Config(ConfigError::NotRunning)
        ));
        assert!(matches!(
            ctx.start().unwrap_err(),
            DiffusionError::Config(ConfigError::PoolExhausted)
        ));

        // Reconfiguring after a finished run is allowed.
        ctx.configure(&input, &config(Method::Testing, &[])).unwrap();
        ctx.start().unwrap();
        ctx.iterate(1).unwrap();
        ctx.finish().unwrap();
    }

    #[test]
    fn test_drop_while_running_joins_pool() {
        let input = random_scalar_volume([4, 4, 4], 4);
        let mut cfg = config(Method::Homogeneous, &[0.1]);
        cfg.num_threads = 3;
        let mut ctx = DiffusionContext::new();
        ctx.configure(&input, &cfg).unwrap();
        ctx.start().unwrap();
        ctx.iterate(2).unwrap();
        drop(ctx);
    }

    #[test]
    fn test_failed_configure_preserves_previous_state() {
        let input = random_scalar_volume([4, 4, 4], 6);
        let mut ctx = DiffusionContext::new();
        ctx.configure(&input, &config(Method::Homogeneous, &[0.1]))
            .unwrap();

        // A bad reconfigure must not clobber the good configuration.
        let err = ctx
            .configure(&input, &config(Method::PeronaMalik, &[0.1]))
            .unwrap_err();
        assert!(matches!(err, DiffusionError::Config(_)));

        ctx.start().unwrap();
        ctx.iterate(1).unwrap();
        ctx.finish().unwrap();
        assert_eq!(ctx.output().unwrap().shape(), input.shape());
    }

    // ==================== Slice claim protocol ====================

    #[test]
    fn test_claim_hands_out_each_slice_once() {
        let input = random_scalar_volume([2, 2, 5], 9);
        let mut ctx = DiffusionContext::new();
        ctx.configure(&input, &config(Method::Testing, &[])).unwrap();
        let shared = ctx.shared.as_ref().unwrap();

        let mut seen = Vec::new();
        loop {
            let z = claim_next_slice(shared, Phase::Filter);
            if z == 5 {
                break;
            }
            seen.push(z);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        // Filter exhausted: further filter claims stay at the sentinel, and
        // the update phase has been armed.
        assert_eq!(claim_next_slice(shared, Phase::Filter), 5);
        assert_eq!(claim_next_slice(shared, Phase::Update), 0);
    }

    #[test]
    fn test_claim_phases_alternate() {
        let input = random_scalar_volume([2, 2, 3], 10);
        let mut ctx = DiffusionContext::new();
        ctx.configure(&input, &config(Method::Testing, &[])).unwrap();
        let shared = ctx.shared.as_ref().unwrap();

        for _round in 0..3 {
            for expect in 0..3 {
                assert_eq!(claim_next_slice(shared, Phase::Filter), expect);
            }
            assert_eq!(claim_next_slice(shared, Phase::Filter), 3);
            for expect in 0..3 {
                assert_eq!(claim_next_slice(shared, Phase::Update), expect);
            }
            assert_eq!(claim_next_slice(shared, Phase::Update), 3);
        }
    }
}
