//! End-to-end tests for the convolution compute core on the CPU target.

use grove_core::matrix::{local_mat, local_mat_from_samples};
use grove_core::{ComputeTarget, LocalMat};
use grove_neural::layers::learning::{Convolution, ConvolutionSpec, Deconvolution};
use grove_neural::layers::ExecutionContext;
use grove_neural::weights::WeightRegistry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TOL: f32 = 1e-4;

fn random_samples(len: usize, samples: usize, rng: &mut StdRng) -> LocalMat<f32> {
    let data: Vec<f32> = (0..len * samples).map(|_| rng.gen_range(-1.0..1.0)).collect();
    local_mat_from_samples(len, samples, data).unwrap()
}

/// Nested-loop reference convolution over one channel-first sample.
#[allow(clippy::too_many_arguments)]
fn naive_conv2d(
    input: &[f32],
    kernel: &[f32],
    in_channels: usize,
    out_channels: usize,
    in_h: usize,
    in_w: usize,
    k_h: usize,
    k_w: usize,
    pad: usize,
    stride: usize,
) -> Vec<f32> {
    let out_h = (in_h + 2 * pad - k_h) / stride + 1;
    let out_w = (in_w + 2 * pad - k_w) / stride + 1;
    let mut output = vec![0.0f32; out_channels * out_h * out_w];
    for oc in 0..out_channels {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let mut acc = 0.0;
                for ic in 0..in_channels {
                    for ky in 0..k_h {
                        for kx in 0..k_w {
                            let iy = (oy * stride + ky) as isize - pad as isize;
                            let ix = (ox * stride + kx) as isize - pad as isize;
                            if iy < 0 || iy >= in_h as isize || ix < 0 || ix >= in_w as isize {
                                continue;
                            }
                            let i = (ic * in_h + iy as usize) * in_w + ix as usize;
                            let k = ((oc * in_channels + ic) * k_h + ky) * k_w + kx;
                            acc += input[i] * kernel[k];
                        }
                    }
                }
                output[(oc * out_h + oy) * out_w + ox] = acc;
            }
        }
    }
    output
}

fn set_kernel(layer_kernel: &grove_neural::WeightsRef<f32>, values: &[f32]) {
    let mut weights = layer_kernel.write().unwrap();
    for (dst, &v) in weights.values_mut().iter_mut().zip(values) {
        *dst = v;
    }
}

#[test]
fn unfold_forward_matches_naive_reference() {
    let mut rng = StdRng::seed_from_u64(11);
    let (in_c, out_c, h, w, k, pad, stride) = (3, 4, 7, 6, 3, 1, 2);
    let spec = ConvolutionSpec {
        out_channels: out_c,
        kernel_dims: vec![k, k],
        pads: vec![pad, pad],
        strides: vec![stride, stride],
        dilations: vec![1, 1],
        groups: 1,
        bias: false,
    };
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![in_c, h, w], &mut registry, &mut rng).unwrap();

    let kernel: Vec<f32> = (0..out_c * in_c * k * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
    set_kernel(layer.base().kernel_weights().unwrap(), &kernel);

    let input = random_samples(in_c * h * w, 3, &mut rng);
    let output = layer.forward(&input).unwrap();

    for sample in 0..3 {
        let input_sample = input.column(sample).to_vec();
        let expected = naive_conv2d(&input_sample, &kernel, in_c, out_c, h, w, k, k, pad, stride);
        let got = output.column(sample).to_vec();
        assert_eq!(got.len(), expected.len());
        for (a, b) in got.iter().zip(expected.iter()) {
            assert!((a - b).abs() < TOL, "got {a}, expected {b}");
        }
    }
}

#[test]
fn identity_kernel_round_trips_through_forward_and_backward() {
    let mut rng = StdRng::seed_from_u64(5);
    let spec = ConvolutionSpec::simple(1, vec![3, 3], vec![1, 1], false);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![1, 5, 5], &mut registry, &mut rng).unwrap();

    // Single 1 at the kernel center: convolution becomes the identity.
    let mut kernel = vec![0.0f32; 9];
    kernel[4] = 1.0;
    set_kernel(layer.base().kernel_weights().unwrap(), &kernel);

    let input = random_samples(25, 2, &mut rng);
    let output = layer.forward(&input).unwrap();
    for (a, b) in output.iter().zip(input.iter()) {
        assert!((a - b).abs() < TOL);
    }

    // The adjoint of the identity is the identity.
    let context = ExecutionContext::new(2);
    let grad_input = layer.backward(&input, &output, &context).unwrap();
    for (a, b) in grad_input.iter().zip(input.iter()) {
        assert!((a - b).abs() < TOL);
    }
}

#[test]
fn bias_application_broadcasts_per_channel() {
    let mut rng = StdRng::seed_from_u64(3);
    let spec = ConvolutionSpec::simple(2, vec![1, 1], vec![0, 0], true);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![2, 2, 2], &mut registry, &mut rng).unwrap();

    // Identity 1x1 kernel per channel would mix channels; make it diagonal.
    set_kernel(layer.base().kernel_weights().unwrap(), &[1.0, 0.0, 0.0, 1.0]);
    {
        let bias = layer.base().bias_weights().unwrap();
        let mut weights = bias.write().unwrap();
        weights.values_mut()[[0, 0]] = 0.5;
        weights.values_mut()[[1, 0]] = -2.0;
    }

    let input = local_mat_from_samples(8, 1, vec![1.0f32; 8]).unwrap();
    let output = layer.forward(&input).unwrap();
    // Channel 0 rows get +0.5, channel 1 rows get -2.0.
    for row in 0..4 {
        assert!((output[[row, 0]] - 1.5).abs() < TOL);
    }
    for row in 4..8 {
        assert!((output[[row, 0]] + 1.0).abs() < TOL);
    }
}

#[test]
fn disabled_bias_leaves_the_output_untouched() {
    let mut rng = StdRng::seed_from_u64(3);
    let spec = ConvolutionSpec::simple(1, vec![1, 1], vec![0, 0], false);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![1, 2, 2], &mut registry, &mut rng).unwrap();
    set_kernel(layer.base().kernel_weights().unwrap(), &[1.0]);

    let input = random_samples(4, 2, &mut rng);
    let mut output = input.clone();
    // A zero bias scaling factor short-circuits before touching the data.
    layer.base().apply_bias(&mut output).unwrap();
    assert_eq!(output, input);
}

#[test]
fn kernel_gradient_matches_hand_computed_patch_sums() {
    let mut rng = StdRng::seed_from_u64(9);
    let spec = ConvolutionSpec::simple(1, vec![2, 2], vec![0, 0], true);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![1, 3, 3], &mut registry, &mut rng).unwrap();
    set_kernel(layer.base().kernel_weights().unwrap(), &[0.0; 4]);

    let input = local_mat_from_samples(
        9,
        1,
        vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
    )
    .unwrap();
    let grad_output = local_mat_from_samples(4, 1, vec![1.0f32; 4]).unwrap();
    let context = ExecutionContext::new(1);
    layer.backward(&input, &grad_output, &context).unwrap();

    // With all-ones output gradient, dW[ky][kx] is the sum of the input
    // entries the (ky, kx) tap sees across the four 2x2 windows.
    let expected = [
        1.0 + 2.0 + 4.0 + 5.0,
        2.0 + 3.0 + 5.0 + 6.0,
        4.0 + 5.0 + 7.0 + 8.0,
        5.0 + 6.0 + 8.0 + 9.0,
    ];
    let weights = layer.base().kernel_weights().unwrap().read().unwrap();
    let gradient = weights.optimizer().unwrap().gradient();
    for (i, &e) in expected.iter().enumerate() {
        assert!((gradient[[0, i]] - e).abs() < TOL);
    }

    // The bias gradient is the plain sum of the output gradient.
    let bias = layer.base().bias_weights().unwrap().read().unwrap();
    let bias_grad = bias.optimizer().unwrap().gradient();
    assert!((bias_grad[[0, 0]] - 4.0).abs() < TOL);
}

#[test]
fn gradients_are_scaled_by_the_effective_mini_batch_size() {
    let mut rng = StdRng::seed_from_u64(9);
    let spec = ConvolutionSpec::simple(1, vec![2, 2], vec![0, 0], false);

    let run = |emb: usize, rng: &mut StdRng| -> f32 {
        let mut layer = Convolution::<f32>::new("conv", spec.clone(), ComputeTarget::Cpu);
        let mut registry = WeightRegistry::new();
        layer.setup(vec![1, 3, 3], &mut registry, rng).unwrap();
        let input = local_mat_from_samples(9, 1, (1..=9).map(|v| v as f32).collect()).unwrap();
        let grad_output = local_mat_from_samples(4, 1, vec![1.0f32; 4]).unwrap();
        layer
            .backward(&input, &grad_output, &ExecutionContext::new(emb))
            .unwrap();
        let weights = layer.base().kernel_weights().unwrap().read().unwrap();
        let g = weights.optimizer().unwrap().gradient()[[0, 0]];
        g
    };

    let g1 = run(1, &mut rng);
    let g4 = run(4, &mut rng);
    assert!((g1 - 4.0 * g4).abs() < TOL);
}

#[test]
fn repeated_backward_accumulates_into_the_gradient_buffer() {
    let mut rng = StdRng::seed_from_u64(17);
    let spec = ConvolutionSpec::simple(1, vec![2, 2], vec![0, 0], false);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![1, 3, 3], &mut registry, &mut rng).unwrap();

    let input = random_samples(9, 2, &mut rng);
    let grad_output = random_samples(4, 2, &mut rng);
    let context = ExecutionContext::new(2);

    layer.backward(&input, &grad_output, &context).unwrap();
    let first = {
        let weights = layer.base().kernel_weights().unwrap().read().unwrap();
        weights.optimizer().unwrap().gradient().clone()
    };

    // Second deposit in the same step adds on top of the first.
    layer.backward(&input, &grad_output, &context).unwrap();
    {
        let weights = layer.base().kernel_weights().unwrap().read().unwrap();
        let gradient = weights.optimizer().unwrap().gradient();
        for (a, b) in gradient.iter().zip(first.iter()) {
            assert!((a - 2.0 * b).abs() < TOL);
        }
    }

    // After the step boundary the next deposit overwrites.
    {
        let handle = layer.base().kernel_weights().unwrap().clone();
        let mut weights = handle.write().unwrap();
        weights.optimizer_mut().unwrap().clear();
    }
    layer.backward(&input, &grad_output, &context).unwrap();
    let weights = layer.base().kernel_weights().unwrap().read().unwrap();
    let gradient = weights.optimizer().unwrap().gradient();
    for (a, b) in gradient.iter().zip(first.iter()) {
        assert!((a - b).abs() < TOL);
    }
}

#[test]
fn empty_shard_is_a_no_op_forward_and_still_scales_gradients_backward() {
    let mut rng = StdRng::seed_from_u64(23);
    let spec = ConvolutionSpec::simple(2, vec![3, 3], vec![1, 1], false);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![2, 4, 4], &mut registry, &mut rng).unwrap();

    let empty_input = local_mat::<f32>(32, 0);
    let output = layer.forward(&empty_input).unwrap();
    assert_eq!(output.ncols(), 0);

    // Seed the gradient buffer, then run an empty-shard backward pass in
    // the same step: dst_scale is 1, so the content survives.
    {
        let handle = layer.base().kernel_weights().unwrap().clone();
        let mut weights = handle.write().unwrap();
        weights
            .optimizer_mut()
            .unwrap()
            .gradient_buffer(true)
            .gradient
            .fill(5.0);
    }
    let empty_grad = local_mat::<f32>(32, 0);
    let context = ExecutionContext::new(8);
    layer.backward(&empty_input, &empty_grad, &context).unwrap();
    {
        let weights = layer.base().kernel_weights().unwrap().read().unwrap();
        assert!(weights.optimizer().unwrap().gradient().iter().all(|&v| v == 5.0));
    }

    // At a fresh step the empty shard owes dst_scale = 0: the buffer is
    // zeroed, keeping the cross-process reduction well defined.
    {
        let handle = layer.base().kernel_weights().unwrap().clone();
        let mut weights = handle.write().unwrap();
        weights.optimizer_mut().unwrap().clear();
    }
    layer.backward(&empty_input, &empty_grad, &context).unwrap();
    let weights = layer.base().kernel_weights().unwrap().read().unwrap();
    assert!(weights.optimizer().unwrap().gradient().iter().all(|&v| v == 0.0));
}

#[test]
fn deconvolution_forward_is_the_adjoint_of_convolution() {
    let mut rng = StdRng::seed_from_u64(31);
    let spec = ConvolutionSpec::simple(1, vec![3, 3], vec![1, 1], false);

    let mut conv = Convolution::<f32>::new("conv", spec.clone(), ComputeTarget::Cpu);
    let mut registry = WeightRegistry::new();
    conv.setup(vec![1, 4, 4], &mut registry, &mut rng).unwrap();

    let mut deconv = Deconvolution::<f32>::new("deconv", spec, ComputeTarget::Cpu);
    deconv.setup(vec![1, 4, 4], &mut registry, &mut rng).unwrap();

    // Same single-channel kernel in both layers.
    let kernel: Vec<f32> = (0..9).map(|v| v as f32 * 0.1).collect();
    set_kernel(conv.base().kernel_weights().unwrap(), &kernel);
    set_kernel(deconv.base().kernel_weights().unwrap(), &kernel);

    let signal = random_samples(16, 2, &mut rng);
    // Convolution's backward-data pass and deconvolution's forward pass are
    // the same transposed application.
    let context = ExecutionContext::new(2);
    let via_backward = conv.backward(&signal, &signal, &context).unwrap();
    let via_forward = deconv.forward(&signal).unwrap();
    for (a, b) in via_backward.iter().zip(via_forward.iter()) {
        assert!((a - b).abs() < TOL);
    }
}

#[test]
fn frozen_layer_deposits_no_gradients() {
    let mut rng = StdRng::seed_from_u64(41);
    let spec = ConvolutionSpec::simple(1, vec![2, 2], vec![0, 0], false);
    let mut layer = Convolution::<f32>::new("conv", spec, ComputeTarget::Cpu);
    layer.base_mut().set_frozen(true);
    let mut registry = WeightRegistry::new();
    layer.setup(vec![1, 3, 3], &mut registry, &mut rng).unwrap();

    let input = random_samples(9, 1, &mut rng);
    let grad_output = random_samples(4, 1, &mut rng);
    layer
        .backward(&input, &grad_output, &ExecutionContext::new(1))
        .unwrap();

    let weights = layer.base().kernel_weights().unwrap().read().unwrap();
    assert!(weights.is_frozen());
    assert!(weights.optimizer().unwrap().gradient().iter().all(|&v| v == 0.0));
}
