use serde::{Deserialize, Serialize};

use crate::core::dtype::DType;
use crate::core::shape::ShapeKey;
use crate::error::{Result, TensorizeError};
use crate::te::{compute_named, placeholder, reduce_axis, select, sum, Expr, IterVar, Tensor};

/// Direct 2-D convolution, NCHW activations and KCRS filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dOp {
    pub name: String,
    pub batch: usize,
    pub in_channels: usize,
    pub height: usize,
    pub width: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub dtype: DType,
    pub out_dtype: DType,
}

/// Tensors of a built convolution, in dataflow order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvTensors {
    pub src: Tensor,
    pub filter: Tensor,
    /// Zero-padded view of `src`; meant to be inlined.
    pub padded: Tensor,
    pub output: Tensor,
}

impl ConvTensors {
    /// Boundary tensors handed to the lowering backend.
    pub fn args(&self) -> [Tensor; 3] {
        [self.src.clone(), self.filter.clone(), self.output.clone()]
    }
}

impl Conv2dOp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        batch: usize,
        in_channels: usize,
        height: usize,
        width: usize,
        out_channels: usize,
        kernel_h: usize,
        kernel_w: usize,
    ) -> Self {
        Self {
            name: name.to_string(),
            batch,
            in_channels,
            height,
            width,
            out_channels,
            kernel_h,
            kernel_w,
            stride: 1,
            padding: 0,
            dilation: 1,
            dtype: DType::Float16,
            out_dtype: DType::Float32,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_dtypes(mut self, dtype: DType, out_dtype: DType) -> Self {
        self.dtype = dtype;
        self.out_dtype = out_dtype;
        self
    }

    /// The 3x3 layer the tensor-core schedule is tuned for:
    /// N=256, C=256, 14x14, K=512, pad 1.
    pub fn reference_workload() -> Self {
        Self::new("ResNet-Conv3x3-256-B256", 256, 256, 14, 14, 512, 3, 3).with_padding(1)
    }

    fn dilated(&self, kernel: usize) -> usize {
        (kernel - 1) * self.dilation + 1
    }

    pub fn out_height(&self) -> usize {
        (self.height + 2 * self.padding - self.dilated(self.kernel_h)) / self.stride + 1
    }

    pub fn out_width(&self) -> usize {
        (self.width + 2 * self.padding - self.dilated(self.kernel_w)) / self.stride + 1
    }

    /// GEMM dimensions of the equivalent implicit GEMM.
    pub fn gemm_dims(&self) -> (usize, usize, usize) {
        let m = self.batch * self.out_height() * self.out_width();
        let n = self.out_channels;
        let k = self.in_channels * self.kernel_h * self.kernel_w;
        (m, n, k)
    }

    pub fn flops(&self) -> f64 {
        let (m, n, k) = self.gemm_dims();
        2.0 * m as f64 * n as f64 * k as f64
    }

    /// `KxPxQxCxRxS` key of the per-image capsule problem.
    pub fn shape_key(&self) -> Result<ShapeKey> {
        self.validate()?;
        ShapeKey::new(
            self.out_channels,
            self.out_height(),
            self.out_width(),
            self.in_channels,
            self.kernel_h,
            self.kernel_w,
        )
    }

    pub fn validate(&self) -> Result<()> {
        let extents = [
            self.batch,
            self.in_channels,
            self.height,
            self.width,
            self.out_channels,
            self.kernel_h,
            self.kernel_w,
            self.stride,
            self.dilation,
        ];
        if extents.contains(&0) {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("conv2d `{}`", self.name),
                expected: "positive extents, stride and dilation".into(),
                actual: format!("{:?}", extents),
            });
        }
        let fits = self.dilated(self.kernel_h) <= self.height + 2 * self.padding
            && self.dilated(self.kernel_w) <= self.width + 2 * self.padding;
        if !fits {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("conv2d `{}` window", self.name),
                expected: format!(
                    "at most the padded input {}x{}",
                    self.height + 2 * self.padding,
                    self.width + 2 * self.padding
                ),
                actual: format!("{}x{}", self.dilated(self.kernel_h), self.dilated(self.kernel_w)),
            });
        }
        Ok(())
    }

    fn in_bounds(&self, h: &Expr, w: &Expr) -> Expr {
        let pad = Expr::from(self.padding);
        h.clone()
            .ge(pad.clone())
            .and(h.clone().lt(Expr::from(self.height + self.padding)))
            .and(w.clone().ge(pad.clone()))
            .and(w.clone().lt(Expr::from(self.width + self.padding)))
    }

    /// Accumulation happens in the promoted type; the result is cast once.
    fn finish(&self, total: Expr) -> Expr {
        if total.dtype() == self.out_dtype {
            total
        } else {
            total.cast(self.out_dtype)
        }
    }

    fn window(&self, out: &Expr, tap: &IterVar) -> Expr {
        out.clone() * Expr::from(self.stride) + tap.expr() * Expr::from(self.dilation)
    }

    /// `Output[n,k,p,q] = sum(Padded[n,rc,p*st+rr*d,q*st+rs*d] * Filter[k,rc,rr,rs])`.
    pub fn build_nchw(&self) -> Result<ConvTensors> {
        self.validate()?;
        let (hp, wp) = (self.height + 2 * self.padding, self.width + 2 * self.padding);
        let src = placeholder(&[self.batch, self.in_channels, self.height, self.width], self.dtype, "Src");
        let filter = placeholder(
            &[self.out_channels, self.in_channels, self.kernel_h, self.kernel_w],
            self.dtype,
            "Filter",
        );

        let pad = Expr::from(self.padding);
        let padded = compute_named(&[self.batch, self.in_channels, hp, wp], &["n", "c", "h", "w"], "Padded", |ax| {
            let (n, c, h, w) = (&ax[0], &ax[1], &ax[2], &ax[3]);
            select(
                self.in_bounds(h, w),
                src.load(vec![n.clone(), c.clone(), h.clone() - pad.clone(), w.clone() - pad.clone()]),
                Expr::zero(self.dtype),
            )
        });

        let rr = reduce_axis(self.kernel_h, "rr");
        let rs = reduce_axis(self.kernel_w, "rs");
        let rc = reduce_axis(self.in_channels, "rc");
        let acc = self.dtype.accumulator();
        let output = compute_named(
            &[self.batch, self.out_channels, self.out_height(), self.out_width()],
            &["n", "k", "p", "q"],
            "Output",
            |ax| {
                let (n, k, p, q) = (&ax[0], &ax[1], &ax[2], &ax[3]);
                let image = padded.load(vec![n.clone(), rc.expr(), self.window(p, &rr), self.window(q, &rs)]);
                let weight = filter.load(vec![k.clone(), rc.expr(), rr.expr(), rs.expr()]);
                self.finish(sum(image.cast(acc) * weight.cast(acc), &[rr.clone(), rs.clone(), rc.clone()]))
            },
        );

        Ok(ConvTensors { src, filter, padded, output })
    }

    /// Packed variant: batch, input and output channels carry inner blocks of
    /// `ni`, `ci` and `ki` as the two innermost dimensions.
    pub fn build_nchwnc(&self, ni: usize, ci: usize, ki: usize) -> Result<ConvTensors> {
        self.validate()?;
        let divisible = ni > 0
            && ci > 0
            && ki > 0
            && self.batch % ni == 0
            && self.in_channels % ci == 0
            && self.out_channels % ki == 0;
        if !divisible {
            return Err(TensorizeError::ShapeMismatch {
                context: format!("nchwnc packing of `{}`", self.name),
                expected: format!(
                    "blocks dividing N={}, C={}, K={}",
                    self.batch, self.in_channels, self.out_channels
                ),
                actual: format!("ni={}, ci={}, ki={}", ni, ci, ki),
            });
        }
        let (no, co, ko) = (self.batch / ni, self.in_channels / ci, self.out_channels / ki);
        let (hp, wp) = (self.height + 2 * self.padding, self.width + 2 * self.padding);

        let src = placeholder(&[no, co, self.height, self.width, ni, ci], self.dtype, "Src");
        let filter = placeholder(&[ko, co, self.kernel_h, self.kernel_w, ki, ci], self.dtype, "Filter");

        let pad = Expr::from(self.padding);
        let padded = compute_named(
            &[no, co, hp, wp, ni, ci],
            &["n", "c", "h", "w", "nn", "cc"],
            "Padded",
            |ax| {
                let (h, w) = (&ax[2], &ax[3]);
                select(
                    self.in_bounds(h, w),
                    src.load(vec![
                        ax[0].clone(),
                        ax[1].clone(),
                        h.clone() - pad.clone(),
                        w.clone() - pad.clone(),
                        ax[4].clone(),
                        ax[5].clone(),
                    ]),
                    Expr::zero(self.dtype),
                )
            },
        );

        let rr = reduce_axis(self.kernel_h, "rr");
        let rs = reduce_axis(self.kernel_w, "rs");
        let rco = reduce_axis(co, "rco");
        let rci = reduce_axis(ci, "rci");
        let acc = self.dtype.accumulator();
        let output = compute_named(
            &[no, ko, self.out_height(), self.out_width(), ni, ki],
            &["n", "k", "p", "q", "nn", "kk"],
            "Output",
            |ax| {
                let (n, k, p, q, nn, kk) = (&ax[0], &ax[1], &ax[2], &ax[3], &ax[4], &ax[5]);
                let image = padded.load(vec![
                    n.clone(),
                    rco.expr(),
                    self.window(p, &rr),
                    self.window(q, &rs),
                    nn.clone(),
                    rci.expr(),
                ]);
                let weight = filter.load(vec![k.clone(), rco.expr(), rr.expr(), rs.expr(), kk.clone(), rci.expr()]);
                self.finish(sum(
                    image.cast(acc) * weight.cast(acc),
                    &[rr.clone(), rs.clone(), rco.clone(), rci.clone()],
                ))
            },
        );

        Ok(ConvTensors { src, filter, padded, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_extent() {
        let op = Conv2dOp::reference_workload();
        assert_eq!((op.out_height(), op.out_width()), (14, 14));
        let strided = Conv2dOp::new("s2", 1, 3, 224, 224, 64, 7, 7).with_stride(2).with_padding(3);
        assert_eq!(strided.out_height(), 112);
        let dilated = Conv2dOp::new("d2", 1, 8, 10, 10, 8, 3, 3).with_dilation(2);
        assert_eq!(dilated.out_width(), 6);
    }

    #[test]
    fn test_build_nchw_shapes() {
        let conv = Conv2dOp::reference_workload().build_nchw().unwrap();
        assert_eq!(conv.padded.shape(), &[256, 256, 16, 16]);
        assert_eq!(conv.output.shape(), &[256, 512, 14, 14]);
        assert_eq!(conv.output.dtype(), DType::Float32);
        assert_eq!(conv.output.reduce_axes().len(), 3);

        let half = Conv2dOp::reference_workload().with_dtypes(DType::Float16, DType::Float16);
        let conv16 = half.build_nchw().unwrap();
        assert_eq!(conv16.output.dtype(), DType::Float16);
        assert_eq!(conv16.output.reduce_axes().len(), 3);
        assert!(conv.output.input_tensors()[0].same_as(&conv.padded));
    }

    #[test]
    fn test_nchwnc_requires_divisible_blocks() {
        let op = Conv2dOp::reference_workload();
        let packed = op.build_nchwnc(16, 16, 16).unwrap();
        assert_eq!(packed.output.shape(), &[16, 32, 14, 14, 16, 16]);
        assert!(matches!(op.build_nchwnc(16, 24, 16), Err(TensorizeError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_window_larger_than_input() {
        let op = Conv2dOp::new("tiny", 1, 1, 2, 2, 1, 5, 5);
        assert!(matches!(op.validate(), Err(TensorizeError::ShapeMismatch { .. })));
        assert!(op.shape_key().is_err());
    }
}
