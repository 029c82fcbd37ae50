use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tensorize::te::Evaluator;
use tensorize::{Conv2dOp, DType};

fn random(shape: &[usize], dtype: DType, rng: &mut StdRng) -> ArrayD<f64> {
    ArrayD::from_shape_fn(IxDyn(shape), |_| dtype.round(rng.gen_range(-1.0..1.0)))
}

/// Nested-loop convolution with zero padding, accumulated in f64.
fn naive(op: &Conv2dOp, src: &ArrayD<f64>, filter: &ArrayD<f64>) -> ArrayD<f64> {
    let (oh, ow) = (op.out_height(), op.out_width());
    let mut out = ArrayD::zeros(IxDyn(&[op.batch, op.out_channels, oh, ow]));
    for n in 0..op.batch {
        for k in 0..op.out_channels {
            for p in 0..oh {
                for q in 0..ow {
                    let mut acc = 0.0;
                    for c in 0..op.in_channels {
                        for r in 0..op.kernel_h {
                            for s in 0..op.kernel_w {
                                let h = (p * op.stride + r * op.dilation) as i64 - op.padding as i64;
                                let w = (q * op.stride + s * op.dilation) as i64 - op.padding as i64;
                                if h < 0 || w < 0 || h >= op.height as i64 || w >= op.width as i64 {
                                    continue;
                                }
                                acc += src[IxDyn(&[n, c, h as usize, w as usize])] * filter[IxDyn(&[k, c, r, s])];
                            }
                        }
                    }
                    out[IxDyn(&[n, k, p, q])] = acc;
                }
            }
        }
    }
    out
}

fn check(op: Conv2dOp, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let tensors = op.build_nchw().unwrap();
    let src = random(tensors.src.shape(), op.dtype, &mut rng);
    let filter = random(tensors.filter.shape(), op.dtype, &mut rng);

    let mut eval = Evaluator::new();
    eval.bind(&tensors.src, src.clone()).unwrap();
    eval.bind(&tensors.filter, filter.clone()).unwrap();
    let got = eval.evaluate(&tensors.output).unwrap();
    let want = naive(&op, &src, &filter);

    assert_eq!(got.shape(), want.shape());
    for (g, w) in got.iter().zip(want.iter()) {
        assert!((g - w).abs() <= 1e-3 * (1.0 + w.abs()), "{} vs {}", g, w);
    }
}

#[test]
fn test_padded_conv_matches_naive() {
    check(Conv2dOp::new("pad1", 2, 3, 5, 5, 4, 3, 3).with_padding(1), 1);
}

#[test]
fn test_strided_dilated_conv_matches_naive() {
    let op = Conv2dOp::new("s2d2", 1, 2, 9, 9, 3, 3, 3)
        .with_padding(2)
        .with_stride(2)
        .with_dilation(2);
    assert_eq!(op.out_height(), 5);
    check(op, 2);
}

#[test]
fn test_half_output_within_rounding() {
    let op = Conv2dOp::new("f16", 1, 8, 3, 3, 2, 3, 3)
        .with_padding(1)
        .with_dtypes(DType::Float16, DType::Float16);
    check(op, 3);
}
