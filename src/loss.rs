use super::*;
use data_loader::MiniBatch;
use tch::{Kind, Reduction, Tensor};

/// weights of the loss terms.
#[derive(Debug, Clone, Copy)]
pub struct LossConfig {
    /// entropy regularization coefficient.
    pub beta : f64,
    /// share of the value estimate in the value loss.
    pub val_lambda : f64,
}

/// loss terms of one step.
pub struct Losses {
    /// cross entropy weighted by the advantage.
    pub policy : Tensor,
    /// value vs game result.
    pub result : Tensor,
    /// value vs value estimate.
    pub value : Tensor,
    pub total : Tensor,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LossValues {
    pub policy : f64,
    pub result : f64,
    pub value : f64,
    pub total : f64,
}

impl Losses {
    pub fn values(&self) -> LossValues {
        LossValues {
            policy: self.policy.double_value(&[]),
            result: self.result.double_value(&[]),
            value: self.value.double_value(&[]),
            total: self.total.double_value(&[]),
        }
    }
}

/// sum_k p log p for each row. negative entropy.
fn neg_entropy(y1 : &Tensor) -> Tensor {
    (y1.softmax(1, Kind::Float) * y1.log_softmax(1, Kind::Float))
        .sum_dim_intlist(&[1i64][..], false, Kind::Float)
}

/// combine policy logits `y1` and value logit `y2` against `batch`.
///
/// entropy regularization is applied only when `training` and beta > 0.
pub fn compose(y1 : &Tensor, y2 : &Tensor, batch : &MiniBatch, cfg : &LossConfig,
        training : bool) -> Losses {
    let y1 = y1.to_kind(Kind::Float);
    let y2 = y2.to_kind(Kind::Float);
    let ce = y1.cross_entropy_loss::<Tensor>(
        &batch.moves, None, Reduction::None, -100, 0.0);
    let mut policy = (ce * &batch.z).mean(Kind::Float);
    if training && cfg.beta > 0.0 {
        policy = policy + neg_entropy(&y1).mean(Kind::Float) * cfg.beta;
    }
    let result = y2.binary_cross_entropy_with_logits::<Tensor>(
        &batch.result, None, None, Reduction::Mean);
    let value = y2.binary_cross_entropy_with_logits::<Tensor>(
        &batch.value, None, None, Reduction::Mean);
    let total = &policy + &result * (1.0 - cfg.val_lambda) + &value * cfg.val_lambda;
    Losses { policy, result, value, total }
}

/// ratio of positions whose best policy output is the recorded move.
pub fn accuracy(y1 : &Tensor, moves : &Tensor) -> f64 {
    let n = moves.size()[0] as f64;
    y1.argmax(1, false).eq_tensor(moves)
        .sum(Kind::Float).double_value(&[]) / n
}

/// ratio of positions where the value and the result agree on the winner.
pub fn binary_accuracy(y2 : &Tensor, result : &Tensor) -> f64 {
    let n = result.size()[0] as f64;
    y2.ge(0.0).eq_tensor(&result.ge(0.5))
        .sum(Kind::Float).double_value(&[]) / n
}

/// mean entropy of the policy distribution.
pub fn policy_entropy(y1 : &Tensor) -> f64 {
    neg_entropy(&y1.to_kind(Kind::Float)).neg().mean(Kind::Float).double_value(&[])
}

/// mean entropy of sigmoid(y2).
pub fn value_entropy(y2 : &Tensor) -> f64 {
    let y2 = y2.to_kind(Kind::Float);
    let p2 = y2.sigmoid();
    let log1p_ey2 = y2.softplus();
    let entropy = -(&p2 * (&y2 - &log1p_ey2) + (p2.neg() + 1.0) * log1p_ey2.neg());
    entropy.mean(Kind::Float).double_value(&[])
}

#[cfg(test)]
fn batch(moves : &[i64], result : &[f32], value : &[f32]) -> MiniBatch {
    let n = moves.len() as i64;
    let z = result.iter().zip(value).map(|(r, v)| r - v + 0.5).collect::<Vec<f32>>();
    MiniBatch {
        features1: Tensor::zeros([n, 1, 9, 9], (Kind::Float, tch::Device::Cpu)),
        features2: Tensor::zeros([n, 1, 9, 9], (Kind::Float, tch::Device::Cpu)),
        moves: Tensor::from_slice(moves),
        result: Tensor::from_slice(result).view((n, 1)),
        z: Tensor::from_slice(&z),
        value: Tensor::from_slice(value).view((n, 1)),
    }
}

#[cfg(test)]
fn logits() -> (Tensor, Tensor) {
    let y1 = Tensor::from_slice(&[
        2.0f32, 0.5, -1.0, 0.0,
        -0.3, 1.2, 0.7, 0.1,
        0.0, 0.0, 3.0, -2.0]).view((3, 4));
    let y2 = Tensor::from_slice(&[0.8f32, -1.5, 0.1]).view((3, 1));
    (y1, y2)
}

#[test]
fn test_total_is_mixture() {
    let (y1, y2) = logits();
    let b = batch(&[0, 2, 2], &[1.0, 0.0, 0.5], &[0.7, 0.2, 0.5]);
    for lambda in [0.0, 0.333, 0.5, 1.0] {
        let cfg = LossConfig { beta: 0.001, val_lambda: lambda };
        let l = compose(&y1, &y2, &b, &cfg, true).values();
        let expect = l.policy + (1.0 - lambda) * l.result + lambda * l.value;
        assert!((l.total - expect).abs() < 1e-6, "lambda {lambda}");
        if lambda == 0.0 {
            assert!((l.total - l.policy - l.result).abs() < 1e-6);
        }
        if lambda == 1.0 {
            assert!((l.total - l.policy - l.value).abs() < 1e-6);
        }
    }
}

#[test]
fn test_unit_advantage_is_plain_cross_entropy() {
    let (y1, y2) = logits();
    // result - value = 0.5 makes z = 1.
    let b = batch(&[0, 1, 3], &[1.0, 1.0, 0.5], &[0.5, 0.5, 0.0]);
    assert!(b.z.equal(&Tensor::from_slice(&[1.0f32, 1.0, 1.0])));
    let cfg = LossConfig { beta: 0.0, val_lambda: 0.5 };
    let l = compose(&y1, &y2, &b, &cfg, true).values();
    let plain = y1.cross_entropy_for_logits(&b.moves).double_value(&[]);
    assert!((l.policy - plain).abs() < 1e-6);

    // zero advantage cancels the policy term.
    let b = batch(&[0, 1, 3], &[0.0, 0.25, 0.5], &[0.5, 0.75, 1.0]);
    let l = compose(&y1, &y2, &b, &cfg, true).values();
    assert_eq!(l.policy, 0.0);
}

#[test]
fn test_entropy_term() {
    let (y1, y2) = logits();
    let b = batch(&[0, 2, 2], &[1.0, 0.0, 0.5], &[0.7, 0.2, 0.5]);
    let plain = compose(&y1, &y2, &b,
        &LossConfig { beta: 0.0, val_lambda: 0.3 }, true).values();
    let reg = compose(&y1, &y2, &b,
        &LossConfig { beta: 0.1, val_lambda: 0.3 }, true).values();
    let eval = compose(&y1, &y2, &b,
        &LossConfig { beta: 0.1, val_lambda: 0.3 }, false).values();
    // beta * sum p log p is added as it is.
    let expect = plain.policy - 0.1 * policy_entropy(&y1);
    assert!((reg.policy - expect).abs() < 1e-6);
    assert!(reg.policy < plain.policy);
    assert_eq!(eval, plain);
}

#[test]
fn test_accuracy_and_entropy() {
    let (y1, y2) = logits();
    assert!((accuracy(&y1, &Tensor::from_slice(&[0i64, 1, 2])) - 1.0).abs() < 1e-9);
    assert!((accuracy(&y1, &Tensor::from_slice(&[0i64, 2, 3])) - 1.0 / 3.0).abs() < 1e-9);

    let result = Tensor::from_slice(&[1.0f32, 1.0, 0.0]).view((3, 1));
    assert!((binary_accuracy(&y2, &result) - 1.0 / 3.0).abs() < 1e-9);

    let uniform = Tensor::zeros([2, 4], (Kind::Float, tch::Device::Cpu));
    assert!((policy_entropy(&uniform) - 4f64.ln()).abs() < 1e-5);
    let half = Tensor::zeros([2, 1], (Kind::Float, tch::Device::Cpu));
    assert!((value_entropy(&half) - 2f64.ln()).abs() < 1e-5);
    let sure = Tensor::from_slice(&[30.0f32, -30.0]).view((2, 1));
    assert!(value_entropy(&sure).abs() < 1e-5);
}
