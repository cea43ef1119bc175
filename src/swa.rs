use super::*;
use neuralnet::PolicyValueModel;
use optimizer::Sgd;
use std::collections::HashMap;
use tch::nn::VarStore;
use tch::Tensor;

/// stochastic weight averaging over a base optimizer.
///
/// after `swa_start` steps the weights are averaged every `swa_freq` steps.
/// the average weighs the latest `swa_n_avr` snapshots at most like a
/// running mean, older ones decay.
pub struct Swa {
    pub base : Sgd,
    swa_start : usize,
    swa_freq : usize,
    swa_lr : Option<f64>,
    swa_n_avr : usize,
    n_avg : usize,
    step_counter : usize,
    buffers : HashMap<String, Tensor>,
}

impl Swa {
    pub fn new(base : Sgd, swa_start : usize, swa_freq : usize,
            swa_lr : Option<f64>, swa_n_avr : usize) -> Self {
        Self {
            base, swa_start, swa_freq, swa_lr, swa_n_avr,
            n_avg : 0,
            step_counter : 0,
            buffers : HashMap::new(),
        }
    }

    pub fn n_avg(&self) -> usize {
        self.n_avg
    }

    pub fn step(&mut self, vs : &VarStore) {
        if let Some(lr) = self.swa_lr {
            if self.step_counter >= self.swa_start {
                self.base.set_lr(lr);
            }
        }
        self.base.step(vs);
        self.step_counter += 1;
        if self.step_counter > self.swa_start
                && self.step_counter % self.swa_freq == 0 {
            self.update_swa(vs);
        }
    }

    /// fold current weights into the averages.
    pub fn update_swa(&mut self, vs : &VarStore) {
        let virtual_decay = 1.0 / (self.n_avg + 1) as f64;
        tch::no_grad(|| {
            for (name, var) in vs.variables() {
                if !var.requires_grad() {continue;}
                let buf = self.buffers.entry(name)
                    .or_insert_with(|| var.zeros_like());
                let diff = (&var - &*buf) * virtual_decay;
                let _ = buf.add_(&diff);
            }
        });
        if self.n_avg < self.swa_n_avr {
            self.n_avg += 1;
        }
    }

    /// exchange the weights and the averages.
    /// variables without an average are kept as they are.
    pub fn swap_swa_sgd(&mut self, vs : &VarStore) {
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                if !var.requires_grad() {continue;}
                let Some(buf) = self.buffers.get_mut(&name) else {
                    log::warn!("SWA wasn't applied to {name}, skipping it");
                    continue;
                };
                let tmp = var.copy();
                var.copy_(buf);
                buf.copy_(&tmp);
            }
        });
    }
}

/// recompute running statistics of batch normalization as a plain mean
/// over `batches`.
///
/// `momentum` is the one the layers were built with.
pub fn bn_update<M, I>(vs : &VarStore, model : &M, batches : I, momentum : f64)
        -> Result<usize>
        where M : PolicyValueModel, I : IntoIterator<Item = Result<(Tensor, Tensor)>> {
    let mut stats = vs.variables().into_iter().filter(|(name, _)| {
        name.ends_with(".running_mean") || name.ends_with(".running_var")
    }).collect::<Vec<_>>();
    if stats.is_empty() {
        return Ok(0);
    }

    tch::no_grad(|| {
        for (name, stat) in stats.iter_mut() {
            if name.ends_with(".running_mean") {
                let _ = stat.zero_();
            } else {
                let _ = stat.fill_(1.0);
            }
        }
        let mut sums = stats.iter().map(|(_, s)| s.zeros_like()).collect::<Vec<_>>();

        let mut n = 0;
        for batch in batches {
            let (x1, x2) = batch?;
            let prev = stats.iter().map(|(_, s)| s.copy()).collect::<Vec<_>>();
            let _ = model.forward_t(&x1, &x2, true);
            for ((sum, (_, stat)), prev) in sums.iter_mut().zip(stats.iter()).zip(prev) {
                // running = (1 - m) * prev + m * batch_stat
                let batch_stat = (stat - prev * (1.0 - momentum)) / momentum;
                *sum += batch_stat;
            }
            n += 1;
        }

        if n > 0 {
            for ((_, stat), sum) in stats.iter_mut().zip(sums) {
                stat.copy_(&(sum / n as f64));
            }
        }
        Ok(n)
    })
}

#[cfg(test)]
fn store(value : f32) -> (VarStore, Tensor) {
    let vs = VarStore::new(tch::Device::Cpu);
    let w = vs.root().var_copy("w", &Tensor::from_slice(&[value]));
    (vs, w)
}

#[cfg(test)]
fn set(w : &Tensor, value : f32) {
    tch::no_grad(|| {
        let _ = w.shallow_clone().fill_(value as f64);
    });
}

#[test]
fn test_update_and_swap() {
    let (vs, w) = store(1.0);
    let mut swa = Swa::new(Sgd::new(0.1, 0.0, 0.0, false), 0, 1, None, 2);
    swa.update_swa(&vs);
    set(&w, 3.0);
    swa.update_swa(&vs);
    // mean of 1 and 3.
    set(&w, 10.0);
    swa.swap_swa_sgd(&vs);
    assert!((w.double_value(&[0]) - 2.0).abs() < 1e-6);
    swa.swap_swa_sgd(&vs);
    assert!((w.double_value(&[0]) - 10.0).abs() < 1e-6);

    // n_avg stops at swa_n_avr, older snapshots decay.
    assert_eq!(swa.n_avg(), 2);
    swa.update_swa(&vs);
    assert_eq!(swa.n_avg(), 2);
    swa.swap_swa_sgd(&vs);
    assert!((w.double_value(&[0]) - (2.0 + (10.0 - 2.0) / 3.0)).abs() < 1e-5);
}

#[test]
fn test_step_schedule() {
    use tch::Kind;
    let (vs, w) = store(0.0);
    let mut swa = Swa::new(Sgd::new(1.0, 0.0, 0.0, false), 2, 2, Some(0.5), 10);
    for _ in 0..2 {
        swa.base.zero_grad(&vs);
        (&w * -1.0).sum(Kind::Float).backward();
        swa.step(&vs);
    }
    // no average before swa_start.
    assert_eq!(swa.n_avg(), 0);
    assert_eq!(swa.base.lr, 1.0);
    for _ in 0..2 {
        swa.base.zero_grad(&vs);
        (&w * -1.0).sum(Kind::Float).backward();
        swa.step(&vs);
    }
    assert_eq!(swa.n_avg(), 1);
    assert_eq!(swa.base.lr, 0.5);
    // 1 + 1 + 0.5 + 0.5
    assert!((w.double_value(&[0]) - 3.0).abs() < 1e-6);
}

#[test]
fn test_swap_without_average() {
    let (vs, w) = store(4.0);
    let mut swa = Swa::new(Sgd::new(0.1, 0.0, 0.0, false), 0, 1, None, 2);
    swa.swap_swa_sgd(&vs);
    assert_eq!(w.double_value(&[0]), 4.0);
}

#[test]
fn test_bn_update() {
    use tch::{Device, Kind};
    let vs = VarStore::new(Device::Cpu);
    let net = neuralnet::PolicyValueNetwork::new(&vs.root(), &neuralnet::tiny_config(false));
    let opt = (Kind::Float, Device::Cpu);
    let batches = (0..3).map(|i| {
        let x1 = Tensor::randn([8, 4, 9, 9], opt) + i as f64;
        let x2 = Tensor::randn([8, 1, 9, 9], opt);
        Ok((x1, x2))
    }).collect::<Vec<_>>();
    let momentum = tch::nn::BatchNormConfig::default().momentum;
    assert_eq!(bn_update(&vs, &net, batches, momentum).unwrap(), 3);
    let var = vs.variables()["norm1.running_var"].shallow_clone();
    assert!(var.min().double_value(&[]) > 0.0);

    let nf = VarStore::new(Device::Cpu);
    let nfnet = neuralnet::PolicyValueNetwork::new(&nf.root(), &neuralnet::tiny_config(true));
    assert_eq!(bn_update(&nf, &nfnet, Vec::new(), momentum).unwrap(), 0);
}
