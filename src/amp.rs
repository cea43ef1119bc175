use super::*;
use tch::nn::VarStore;
use tch::{Kind, Tensor};

const INIT_SCALE : f64 = 65536.0;
const GROWTH_FACTOR : f64 = 2.0;
const BACKOFF_FACTOR : f64 = 0.5;
const GROWTH_INTERVAL : i64 = 2000;

/// run `f` with autocast enabled when `enabled`.
/// the scope is left when `f` returns, whatever it returns.
pub fn autocast<T, F : FnOnce() -> T>(enabled : bool, f : F) -> T {
    if enabled {
        tch::autocast(true, f)
    } else {
        f()
    }
}

/// dynamic loss scaling for mixed precision training.
///
/// per step: scale -> backward -> unscale -> (clip) -> step -> update.
#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    scale : f64,
    growth_tracker : i64,
    found_inf : bool,
    unscaled : bool,
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new(INIT_SCALE)
    }
}

impl GradScaler {
    pub fn new(scale : f64) -> Self {
        Self { scale, growth_tracker : 0, found_inf : false, unscaled : false }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn growth_tracker(&self) -> i64 {
        self.growth_tracker
    }

    pub fn load(&mut self, scale : f64, growth_tracker : i64) {
        self.scale = scale;
        self.growth_tracker = growth_tracker;
    }

    pub fn scale_loss(&self, loss : &Tensor) -> Tensor {
        loss.to_kind(Kind::Float) * self.scale
    }

    /// divide the gradients by the scale and look for inf/nan.
    /// only the first call in a step has effect.
    pub fn unscale(&mut self, vs : &VarStore) {
        if self.unscaled {return;}

        let inv = 1.0 / self.scale;
        let mut found_inf = false;
        tch::no_grad(|| {
            for var in vs.trainable_variables() {
                let mut grad = var.grad();
                if !grad.defined() {continue;}
                let _ = grad.mul_scalar_(inv);
                if !found_inf {
                    found_inf = grad.isfinite().all().int64_value(&[]) == 0;
                }
            }
        });
        self.found_inf = found_inf;
        self.unscaled = true;
    }

    /// run `step` unless the gradients overflowed.
    /// returns true if stepped.
    pub fn step<F : FnOnce()>(&mut self, vs : &VarStore, step : F) -> bool {
        self.unscale(vs);
        if self.found_inf {
            log::debug!("gradient overflow, skipping step. scale:{}", self.scale);
            false
        } else {
            step();
            true
        }
    }

    /// adjust the scale for the next step.
    pub fn update(&mut self) {
        if self.found_inf {
            self.scale *= BACKOFF_FACTOR;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == GROWTH_INTERVAL {
                self.scale *= GROWTH_FACTOR;
                self.growth_tracker = 0;
            }
        }
        self.found_inf = false;
        self.unscaled = false;
    }
}

#[cfg(test)]
fn store_with_grad(grad : f32) -> VarStore {
    let vs = VarStore::new(tch::Device::Cpu);
    let w = vs.root().var_copy("w", &Tensor::from_slice(&[1.0f32]));
    (&w * grad as f64).sum(Kind::Float).backward();
    vs
}

#[test]
fn test_unscale() {
    let mut scaler = GradScaler::new(8.0);
    let vs = store_with_grad(16.0);
    let stepped = scaler.step(&vs, || {});
    assert!(stepped);
    let g = vs.variables()["w"].grad();
    assert!((g.double_value(&[0]) - 2.0).abs() < 1e-6);

    // second unscale in the same step is ignored.
    scaler.unscale(&vs);
    assert!((vs.variables()["w"].grad().double_value(&[0]) - 2.0).abs() < 1e-6);
    scaler.update();
    assert_eq!(scaler.growth_tracker(), 1);
    assert_eq!(scaler.scale(), 8.0);
}

#[test]
fn test_overflow_skips_step() {
    let mut scaler = GradScaler::new(8.0);
    let vs = store_with_grad(f32::INFINITY);
    let mut called = false;
    assert!(!scaler.step(&vs, || called = true));
    assert!(!called);
    scaler.update();
    assert_eq!(scaler.scale(), 4.0);
    assert_eq!(scaler.growth_tracker(), 0);
}

#[test]
fn test_growth() {
    let mut scaler = GradScaler::new(2.0);
    scaler.load(2.0, GROWTH_INTERVAL - 1);
    let vs = store_with_grad(1.0);
    scaler.step(&vs, || {});
    scaler.update();
    assert_eq!(scaler.scale(), 4.0);
    assert_eq!(scaler.growth_tracker(), 0);
}

#[test]
fn test_autocast_scope() {
    let v = autocast(false, || 3);
    assert_eq!(v, 3);
    let s = GradScaler::default();
    let loss = Tensor::from_slice(&[0.5f32]).sum(Kind::Float);
    assert_eq!(s.scale_loss(&loss).double_value(&[]), 0.5 * INIT_SCALE);
}

#[test]
fn test_clip_after_unscale() {
    use clip::ClipStrategy;
    let clip = ClipStrategy::Adaptive { clip : 0.01, eps : 0.001 };
    let weight = Tensor::from_slice(&[1.0f32, -2.0, 3.0, 0.5]).view((2, 2, 1, 1));
    let upstream = Tensor::from_slice(&[50.0f32, 0.001, -40.0, 0.002]).view((2, 2, 1, 1));
    let grad_of = |scaler : Option<&mut GradScaler>| {
        let vs = VarStore::new(tch::Device::Cpu);
        let w = vs.root().var_copy("w", &weight);
        let loss = (&w * &upstream).sum(Kind::Float);
        match scaler {
            Some(scaler) => {
                scaler.scale_loss(&loss).backward();
                scaler.unscale(&vs);
            },
            None => loss.backward(),
        }
        clip.apply(&vs.trainable_variables()).unwrap();
        w.grad().copy()
    };

    let plain = grad_of(None);
    let mut scaler = GradScaler::new(1024.0);
    let unscaled = grad_of(Some(&mut scaler));
    assert!(unscaled.allclose(&plain, 1e-5, 1e-6, false));
    // both channels were clipped.
    assert!(plain.abs().max().double_value(&[]) < 1.0);
}
