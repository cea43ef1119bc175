use super::*;
use std::collections::HashMap;
use tch::nn::VarStore;
use tch::Tensor;

/// momentum SGD with weight decay.
///
/// keeps momentum buffers by variable name so that they can be stored
/// in the state file.
pub struct Sgd {
    pub lr : f64,
    pub momentum : f64,
    pub weight_decay : f64,
    pub nesterov : bool,
    buffers : HashMap<String, Tensor>,
}

impl Sgd {
    pub fn new(lr : f64, momentum : f64, weight_decay : f64, nesterov : bool) -> Self {
        Self {
            lr, momentum, weight_decay, nesterov,
            buffers : HashMap::new(),
        }
    }

    pub fn set_lr(&mut self, lr : f64) {
        self.lr = lr;
    }

    pub fn zero_grad(&self, vs : &VarStore) {
        for mut var in vs.trainable_variables() {
            var.zero_grad();
        }
    }

    /// update every trainable variable that has a gradient.
    pub fn step(&mut self, vs : &VarStore) {
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if !var.requires_grad() {continue;}
                let grad = var.grad();
                if !grad.defined() {continue;}

                let mut d_p = if self.weight_decay != 0.0 {
                    &grad + &var * self.weight_decay
                } else {
                    grad.copy()
                };
                if self.momentum != 0.0 {
                    let buf = match self.buffers.remove(&name) {
                        Some(buf) => buf * self.momentum + &d_p,
                        None => d_p.copy(),
                    };
                    d_p = if self.nesterov {
                        d_p + &buf * self.momentum
                    } else {
                        buf.copy()
                    };
                    self.buffers.insert(name, buf);
                }
                let _ = var.add_(&(d_p * -self.lr).to_kind(var.kind()));
            }
        });
    }

    /// momentum buffers by variable name.
    pub fn buffers(&self) -> &HashMap<String, Tensor> {
        &self.buffers
    }

    pub fn set_buffer(&mut self, name : &str, buf : Tensor) {
        self.buffers.insert(name.to_string(), buf);
    }
}

#[test]
fn test_sgd_step() {
    use tch::{Device, Kind};
    let vs = VarStore::new(Device::Cpu);
    let w = vs.root().var_copy("w", &Tensor::from_slice(&[1.0f32, -2.0]));
    let mut opt = Sgd::new(0.1, 0.9, 0.0, true);

    (&w * Tensor::from_slice(&[1.0f32, 1.0])).sum(Kind::Float).backward();
    opt.step(&vs);
    // buf = g = 1, d_p = g + 0.9 * buf = 1.9
    assert!((w.double_value(&[0]) - (1.0 - 0.19)).abs() < 1e-6);
    assert!(opt.buffers().contains_key("w"));

    opt.zero_grad(&vs);
    (&w * Tensor::from_slice(&[1.0f32, 1.0])).sum(Kind::Float).backward();
    opt.step(&vs);
    // buf = 0.9 + 1 = 1.9, d_p = 1 + 0.9 * 1.9 = 2.71
    assert!((w.double_value(&[0]) - (0.81 - 0.271)).abs() < 1e-6);
}

#[test]
fn test_sgd_weight_decay_and_no_grad() {
    use tch::{Device, Kind};
    let vs = VarStore::new(Device::Cpu);
    let w = vs.root().var_copy("w", &Tensor::from_slice(&[2.0f32]));
    let unused = vs.root().var_copy("unused", &Tensor::from_slice(&[5.0f32]));
    let mut opt = Sgd::new(0.5, 0.0, 0.1, false);
    (&w * 3.0).sum(Kind::Float).backward();
    opt.step(&vs);
    // d_p = 3 + 0.1 * 2 = 3.2
    assert!((w.double_value(&[0]) - (2.0 - 1.6)).abs() < 1e-6);
    assert_eq!(unused.double_value(&[0]), 5.0);
    assert!(opt.buffers().is_empty());
}
