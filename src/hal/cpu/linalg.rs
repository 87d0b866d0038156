use super::{for_each_chunk_mut, for_each_mut};
use crate::{
    hal::ops::{AxpyOp, GemmOp},
    loom::{
        device::{Cpu, DeviceError},
        num::{Float, Zero},
        ops::DeviceOp,
    },
};

impl<T: Float> DeviceOp<Cpu> for GemmOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, a: self.a, T);
        bind_read!(device, b: self.b, T);
        bind_write!(device, c: self.c, T);

        let gemm = self.gemm;
        let alpha = T::from_f64(gemm.alpha);
        let beta = T::from_f64(gemm.beta);
        for_each_chunk_mut(c, gemm.m, |j, column| {
            for (i, c) in column.iter_mut().enumerate() {
                let mut sum = T::zero();
                for p in 0..gemm.k {
                    sum += a[gemm.index_a(i, p)] * b[gemm.index_b(p, j)];
                }
                // `C` is not read when `beta` is zero, so stale contents never leak in
                *c = match gemm.beta == 0.0 {
                    true => alpha * sum,
                    false => alpha * sum + beta * *c,
                };
            }
        });
        Ok(())
    }
}

impl<T: Float> DeviceOp<Cpu> for AxpyOp<T> {
    fn execute(&self, device: &Cpu) -> Result<(), DeviceError> {
        self.check()?;
        bind_read!(device, x: self.x, T);
        bind_write!(device, y: self.y, T);

        let alpha = T::from_f64(self.alpha);
        for_each_mut(y, |index, y| *y += alpha * x[index]);
        Ok(())
    }
}
