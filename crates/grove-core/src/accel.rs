//! Accelerated-execution descriptors and algorithm selection.
//!
//! Descriptors are the host-side handles bound to one layer's convolution
//! configuration. They are never aliased between owners: copying a layer
//! duplicates its descriptors field by field through the `copy_*_desc`
//! helpers, and each handle is released exactly once when dropped.
//!
//! Algorithm enums and the selection heuristics are plain host code and work
//! without the `gpu` feature; only kernel dispatch lives behind it.

use serde::{Deserialize, Serialize};

/// Element type carried by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    F32,
    F64,
}

/// Whether the primitive flips the kernel.
///
/// Deep-learning "convolution" is cross-correlation; that is the only mode
/// the compute engines use today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvolutionMode {
    CrossCorrelation,
    Convolution,
}

#[derive(Debug, PartialEq, Eq)]
struct FilterDesc {
    data_kind: DataKind,
    dims: Vec<usize>,
}

/// Opaque handle describing a convolution kernel tensor.
#[derive(Debug, PartialEq, Eq)]
pub struct FilterDescriptor(Box<FilterDesc>);

impl FilterDescriptor {
    pub fn new(data_kind: DataKind, dims: Vec<usize>) -> Self {
        Self(Box::new(FilterDesc { data_kind, dims }))
    }

    pub fn data_kind(&self) -> DataKind {
        self.0.data_kind
    }

    pub fn dims(&self) -> &[usize] {
        &self.0.dims
    }

    /// Allocates an independent handle with the same parameters.
    pub fn duplicate(&self) -> Self {
        Self::new(self.0.data_kind, self.0.dims.clone())
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ConvolutionDesc {
    pads: Vec<usize>,
    strides: Vec<usize>,
    dilations: Vec<usize>,
    mode: ConvolutionMode,
    data_kind: DataKind,
    groups: usize,
}

/// Opaque handle describing a convolution operation.
#[derive(Debug, PartialEq, Eq)]
pub struct ConvolutionDescriptor(Box<ConvolutionDesc>);

impl ConvolutionDescriptor {
    pub fn new(
        pads: Vec<usize>,
        strides: Vec<usize>,
        dilations: Vec<usize>,
        mode: ConvolutionMode,
        data_kind: DataKind,
        groups: usize,
    ) -> Self {
        Self(Box::new(ConvolutionDesc {
            pads,
            strides,
            dilations,
            mode,
            data_kind,
            groups,
        }))
    }

    pub fn pads(&self) -> &[usize] {
        &self.0.pads
    }

    pub fn strides(&self) -> &[usize] {
        &self.0.strides
    }

    pub fn dilations(&self) -> &[usize] {
        &self.0.dilations
    }

    pub fn mode(&self) -> ConvolutionMode {
        self.0.mode
    }

    pub fn data_kind(&self) -> DataKind {
        self.0.data_kind
    }

    pub fn groups(&self) -> usize {
        self.0.groups
    }

    /// Allocates an independent handle with the same parameters,
    /// including the group count.
    pub fn duplicate(&self) -> Self {
        Self::new(
            self.0.pads.clone(),
            self.0.strides.clone(),
            self.0.dilations.clone(),
            self.0.mode,
            self.0.data_kind,
            self.0.groups,
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
struct TensorDesc {
    data_kind: DataKind,
    dims: Vec<usize>,
}

/// Opaque handle describing a dense tensor shape (used for the bias).
#[derive(Debug, PartialEq, Eq)]
pub struct TensorDescriptor(Box<TensorDesc>);

impl TensorDescriptor {
    pub fn new(data_kind: DataKind, dims: Vec<usize>) -> Self {
        Self(Box::new(TensorDesc { data_kind, dims }))
    }

    pub fn data_kind(&self) -> DataKind {
        self.0.data_kind
    }

    pub fn dims(&self) -> &[usize] {
        &self.0.dims
    }

    pub fn duplicate(&self) -> Self {
        Self::new(self.0.data_kind, self.0.dims.clone())
    }
}

/// Copies descriptor state between optional handles: allocate the
/// destination when only the source exists, destroy it when only the
/// destination exists, and overwrite parameters otherwise.
pub fn copy_filter_desc(src: Option<&FilterDescriptor>, dst: &mut Option<FilterDescriptor>) {
    match (src, dst.as_mut()) {
        (Some(s), None) => *dst = Some(s.duplicate()),
        (None, Some(_)) => *dst = None,
        (Some(s), Some(d)) => *d = s.duplicate(),
        (None, None) => {}
    }
}

/// See [`copy_filter_desc`].
pub fn copy_convolution_desc(
    src: Option<&ConvolutionDescriptor>,
    dst: &mut Option<ConvolutionDescriptor>,
) {
    match (src, dst.as_mut()) {
        (Some(s), None) => *dst = Some(s.duplicate()),
        (None, Some(_)) => *dst = None,
        (Some(s), Some(d)) => *d = s.duplicate(),
        (None, None) => {}
    }
}

/// See [`copy_filter_desc`].
pub fn copy_tensor_desc(src: Option<&TensorDescriptor>, dst: &mut Option<TensorDescriptor>) {
    match (src, dst.as_mut()) {
        (Some(s), None) => *dst = Some(s.duplicate()),
        (None, Some(_)) => *dst = None,
        (Some(s), Some(d)) => *d = s.duplicate(),
        (None, None) => {}
    }
}

/// Execution strategies for the forward convolution primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwardAlgorithm {
    /// One thread per output entry, gathering its receptive field.
    Direct,
    /// Workgroup-tiled gather; profitable for small stride-1 kernels.
    Tiled,
}

impl ForwardAlgorithm {
    /// Whether the strategy produces bitwise-identical results across runs.
    pub fn is_deterministic(self) -> bool {
        match self {
            ForwardAlgorithm::Direct | ForwardAlgorithm::Tiled => true,
        }
    }
}

/// Execution strategies for the backward-data (transposed) primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackwardDataAlgorithm {
    /// Gather formulation: each input entry sums the kernel positions that
    /// map onto it, so no atomics are involved.
    Direct,
}

impl BackwardDataAlgorithm {
    pub fn is_deterministic(self) -> bool {
        match self {
            BackwardDataAlgorithm::Direct => true,
        }
    }
}

/// Execution strategies for the backward-filter (kernel gradient) primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackwardFilterAlgorithm {
    /// One thread per kernel entry, reducing over batch and positions.
    Direct,
}

impl BackwardFilterAlgorithm {
    pub fn is_deterministic(self) -> bool {
        match self {
            BackwardFilterAlgorithm::Direct => true,
        }
    }
}

/// Largest per-output-channel patch (channels/groups * window entries) the
/// tiled forward kernel can stage in workgroup memory.
pub const MAX_TILED_PATCH: usize = 1024;

/// Picks a forward algorithm for the given problem.
///
/// The heuristic is a black box to callers; results are memoized per local
/// mini-batch width by the layer. When `deterministic` is set, only
/// strategies with reproducibility guarantees are eligible.
#[allow(clippy::too_many_arguments)]
pub fn select_forward_algorithm(
    deterministic: bool,
    kernel_spatial: &[usize],
    strides: &[usize],
    dilations: &[usize],
    groups: usize,
    patch_size: usize,
    local_batch: usize,
    num_positions: usize,
) -> ForwardAlgorithm {
    let candidates = [ForwardAlgorithm::Tiled, ForwardAlgorithm::Direct];
    let unit_geometry = strides.iter().all(|&s| s == 1)
        && dilations.iter().all(|&d| d == 1)
        && groups == 1;
    let small_window = kernel_spatial.iter().all(|&k| k <= 5);
    let enough_work = local_batch * num_positions >= 4096;

    for algo in candidates {
        if deterministic && !algo.is_deterministic() {
            continue;
        }
        match algo {
            ForwardAlgorithm::Tiled
                if unit_geometry && small_window && patch_size <= MAX_TILED_PATCH && enough_work =>
            {
                return algo;
            }
            ForwardAlgorithm::Direct => return algo,
            _ => {}
        }
    }
    ForwardAlgorithm::Direct
}

/// Picks a backward-data algorithm; see [`select_forward_algorithm`].
pub fn select_backward_data_algorithm(deterministic: bool) -> BackwardDataAlgorithm {
    let candidates = [BackwardDataAlgorithm::Direct];
    for algo in candidates {
        if deterministic && !algo.is_deterministic() {
            continue;
        }
        return algo;
    }
    BackwardDataAlgorithm::Direct
}

/// Picks a backward-filter algorithm; see [`select_forward_algorithm`].
pub fn select_backward_filter_algorithm(deterministic: bool) -> BackwardFilterAlgorithm {
    let candidates = [BackwardFilterAlgorithm::Direct];
    for algo in candidates {
        if deterministic && !algo.is_deterministic() {
            continue;
        }
        return algo;
    }
    BackwardFilterAlgorithm::Direct
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copying_into_empty_destination_allocates_independent_handle() {
        let src = Some(FilterDescriptor::new(DataKind::F32, vec![8, 4, 3, 3]));
        let mut dst = None;
        copy_filter_desc(src.as_ref(), &mut dst);
        let dst = dst.unwrap();
        assert_eq!(dst.dims(), &[8, 4, 3, 3]);
        // Dropping the source must leave the copy intact.
        drop(src);
        assert_eq!(dst.data_kind(), DataKind::F32);
    }

    #[test]
    fn copying_from_empty_source_destroys_destination() {
        let mut dst = Some(TensorDescriptor::new(DataKind::F64, vec![1, 8, 1, 1]));
        copy_tensor_desc(None, &mut dst);
        assert!(dst.is_none());
    }

    #[test]
    fn convolution_descriptor_copy_preserves_group_count() {
        let src = ConvolutionDescriptor::new(
            vec![1, 1],
            vec![2, 2],
            vec![1, 1],
            ConvolutionMode::CrossCorrelation,
            DataKind::F32,
            4,
        );
        let mut dst = Some(ConvolutionDescriptor::new(
            vec![0],
            vec![1],
            vec![1],
            ConvolutionMode::CrossCorrelation,
            DataKind::F64,
            1,
        ));
        copy_convolution_desc(Some(&src), &mut dst);
        let dst = dst.unwrap();
        assert_eq!(dst.groups(), 4);
        assert_eq!(dst.strides(), &[2, 2]);
        assert_eq!(dst.data_kind(), DataKind::F32);
    }

    #[test]
    fn forward_selection_prefers_tiled_for_small_stride_one_kernels() {
        let algo = select_forward_algorithm(false, &[3, 3], &[1, 1], &[1, 1], 1, 27, 64, 1024);
        assert_eq!(algo, ForwardAlgorithm::Tiled);
    }

    #[test]
    fn forward_selection_falls_back_to_direct_for_strided_kernels() {
        let algo = select_forward_algorithm(false, &[3, 3], &[2, 2], &[1, 1], 1, 27, 64, 1024);
        assert_eq!(algo, ForwardAlgorithm::Direct);
    }

    #[test]
    fn forward_selection_rejects_tiled_when_patch_exceeds_cache() {
        let algo = select_forward_algorithm(
            false,
            &[3, 3],
            &[1, 1],
            &[1, 1],
            1,
            MAX_TILED_PATCH + 1,
            64,
            1024,
        );
        assert_eq!(algo, ForwardAlgorithm::Direct);
    }

    #[test]
    fn deterministic_mode_only_yields_deterministic_algorithms() {
        let algo = select_forward_algorithm(true, &[3, 3], &[1, 1], &[1, 1], 1, 27, 64, 1024);
        assert!(algo.is_deterministic());
        assert!(select_backward_data_algorithm(true).is_deterministic());
        assert!(select_backward_filter_algorithm(true).is_deterministic());
    }
}
