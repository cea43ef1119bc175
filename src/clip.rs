use super::*;
use tch::{Kind, Tensor};

/// gradient clipping of a run.
/// normalizer-free networks use the adaptive one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClipStrategy {
    Adaptive { clip : f64, eps : f64 },
    GlobalNorm(f64),
    Disabled,
}

impl ClipStrategy {
    pub fn select(normalizer_free : bool, max_norm : f64, clip : f64, eps : f64)
            -> ClipStrategy {
        if normalizer_free {
            ClipStrategy::Adaptive { clip, eps }
        } else if max_norm > 0.0 {
            ClipStrategy::GlobalNorm(max_norm)
        } else {
            ClipStrategy::Disabled
        }
    }

    /// clip gradients of `parameters`.
    /// returns total norm of the gradients before clipping.
    pub fn apply(&self, parameters : &[Tensor]) -> Result<f64> {
        match *self {
            ClipStrategy::Adaptive { clip, eps } =>
                adaptive_grad_clip(parameters, clip, eps),
            ClipStrategy::GlobalNorm(max_norm) =>
                Ok(clip_grad_norm(parameters, max_norm)),
            ClipStrategy::Disabled => Ok(0.0),
        }
    }
}

/// norm for each output unit.
///
/// rank 0, 1 : norm of the whole tensor.
/// rank 2, 3 : norm for each slice of the first dimension.
/// rank 4 : norm for each output channel of a convolution kernel.
pub fn unitwise_norm(x : &Tensor) -> Result<Tensor> {
    let dims : &[i64] = match x.dim() {
        0 | 1 => return Ok(x.detach().norm()),
        2 => &[1],
        3 => &[1, 2],
        4 => &[1, 2, 3],
        n => return Err(TrainError::UnsupportedShape(n)),
    };
    Ok(x.detach().norm_scalaropt_dim(2.0, dims, true))
}

fn grad_sq_sum(grad : &Tensor) -> f64 {
    grad.to_kind(Kind::Float).square().sum(Kind::Float).double_value(&[])
}

/// rescale gradients whose unit-wise norm exceeds
/// `clip` * max(unit-wise norm of the parameter, `eps`).
///
/// parameters without gradient are left untouched.
pub fn adaptive_grad_clip(parameters : &[Tensor], clip : f64, eps : f64) -> Result<f64> {
    let params = parameters.iter()
        .filter(|p| p.grad().defined()).collect::<Vec<_>>();
    if params.is_empty() {
        return Ok(0.0);
    }

    tch::no_grad(|| {
        let mut total = 0.0;
        for p in params {
            let mut grad = p.grad();
            total += grad_sq_sum(&grad);

            let g_norm = unitwise_norm(&grad)?;
            let p_norm = unitwise_norm(p)?;
            let max_norm = p_norm.clamp_min(eps) * clip;
            let trigger = g_norm.gt_tensor(&max_norm);
            // floor only against division by zero.
            let clipped = &grad * (&max_norm / g_norm.clamp_min(1e-6));
            let clipped = clipped.to_kind(grad.kind()).where_self(&trigger, &grad);
            grad.copy_(&clipped);
        }
        Ok(total.sqrt())
    })
}

/// scale all gradients together so that their total norm is `max_norm` at most.
pub fn clip_grad_norm(parameters : &[Tensor], max_norm : f64) -> f64 {
    tch::no_grad(|| {
        let grads = parameters.iter()
            .map(|p| p.grad()).filter(|g| g.defined()).collect::<Vec<_>>();
        let total = grads.iter().map(grad_sq_sum).sum::<f64>().sqrt();
        let coef = max_norm / (total + 1e-6);
        if coef < 1.0 {
            for mut g in grads {
                let _ = g.g_mul_scalar_(coef);
            }
        }
        total
    })
}

#[cfg(test)]
/// leaf tensor holding `value` whose gradient becomes `grad`.
fn param_with_grad(value : &Tensor, grad : &Tensor) -> Tensor {
    let p = value.copy().set_requires_grad(true);
    (&p * grad).sum(Kind::Float).backward();
    p
}

#[test]
fn test_unitwise_norm() {
    let v = Tensor::from_slice(&[3.0f32, 4.0]);
    assert!((unitwise_norm(&v).unwrap().double_value(&[]) - 5.0).abs() < 1e-6);

    let m = Tensor::from_slice(&[3.0f32, 4.0, 0.0, 1.0]).view((2, 2));
    let n = unitwise_norm(&m).unwrap();
    assert_eq!(n.size(), vec![2, 1]);
    assert!((n.double_value(&[0, 0]) - 5.0).abs() < 1e-6);
    assert!((n.double_value(&[1, 0]) - 1.0).abs() < 1e-6);

    let c = Tensor::ones([4, 3, 3, 3], (Kind::Float, tch::Device::Cpu));
    let n = unitwise_norm(&c).unwrap();
    assert_eq!(n.size(), vec![4, 1, 1, 1]);
    assert!((n.double_value(&[2, 0, 0, 0]) - 27f64.sqrt()).abs() < 1e-5);

    let t = Tensor::ones([2, 3, 4], (Kind::Float, tch::Device::Cpu));
    assert_eq!(unitwise_norm(&t).unwrap().size(), vec![2, 1, 1]);

    let five = Tensor::ones([1, 1, 1, 1, 1], (Kind::Float, tch::Device::Cpu));
    assert!(matches!(unitwise_norm(&five), Err(TrainError::UnsupportedShape(5))));
}

#[test]
fn test_small_gradient_is_identity() {
    let value = Tensor::from_slice(&[1.0f32, 2.0, 2.0]);
    let grad = Tensor::from_slice(&[0.001f32, -0.002, 0.0]);
    let p = param_with_grad(&value, &grad);
    let before = p.grad().copy();
    // max norm: 3 * 0.01 = 0.03 > 0.00224
    adaptive_grad_clip(&[p.shallow_clone()], 0.01, 0.001).unwrap();
    assert!(p.grad().equal(&before));
}

#[test]
fn test_huge_gradient_is_rescaled() {
    let value = Tensor::from_slice(&[3.0f32, 4.0]);
    // allowed: 5 * 0.01 = 0.05. gradient norm 50 = 1000x.
    let grad = Tensor::from_slice(&[30.0f32, 40.0]);
    let p = param_with_grad(&value, &grad);
    let total = adaptive_grad_clip(&[p.shallow_clone()], 0.01, 0.001).unwrap();
    assert!((total - 50.0).abs() < 1e-4);
    let g = p.grad();
    assert!((g.norm().double_value(&[]) - 0.05).abs() < 1e-6);
    // direction is kept.
    assert!((g.double_value(&[0]) / g.double_value(&[1]) - 0.75).abs() < 1e-5);
}

#[test]
fn test_eps_floor() {
    // zero parameter still allows eps * clip.
    let value = Tensor::zeros([2], (Kind::Float, tch::Device::Cpu));
    let grad = Tensor::from_slice(&[1.0f32, 0.0]);
    let p = param_with_grad(&value, &grad);
    adaptive_grad_clip(&[p.shallow_clone()], 0.01, 0.001).unwrap();
    assert!((p.grad().norm().double_value(&[]) - 1e-5).abs() < 1e-9);
}

#[test]
fn test_conv_outlier_channel() {
    let opt = (Kind::Float, tch::Device::Cpu);
    // 27 elements of 1/sqrt(27) make norm 1 for each channel.
    let unit = Tensor::ones([4, 3, 3, 3], opt) / 27f64.sqrt();
    let value = &unit * 200.0;
    let scale = Tensor::from_slice(&[1.0f32, 100.0, 1.0, 1.0]).view((4, 1, 1, 1));
    let grad = &unit * &scale;
    let p = param_with_grad(&value, &grad);
    let before = p.grad().copy();

    // allowed: 200 * 0.01 = 2 for each channel.
    adaptive_grad_clip(&[p.shallow_clone()], 0.01, 0.001).unwrap();
    let after = p.grad();
    let norms = unitwise_norm(&after).unwrap();
    assert!((norms.double_value(&[1, 0, 0, 0]) - 2.0).abs() < 1e-4);
    for ch in [0i64, 2, 3] {
        assert!(after.get(ch).equal(&before.get(ch)), "channel {ch}");
    }
}

#[test]
fn test_absent_gradient() {
    let opt = (Kind::Float, tch::Device::Cpu);
    let frozen = Tensor::ones([2, 2], opt).set_requires_grad(true);
    let before = frozen.copy();
    assert_eq!(adaptive_grad_clip(&[frozen.shallow_clone()], 0.01, 0.001).unwrap(), 0.0);
    assert_eq!(adaptive_grad_clip(&[], 0.01, 0.001).unwrap(), 0.0);
    assert!(!frozen.grad().defined());
    assert!(frozen.equal(&before));

    let p = param_with_grad(&Tensor::ones([2], opt), &Tensor::from_slice(&[5.0f32, 0.0]));
    adaptive_grad_clip(&[frozen.shallow_clone(), p.shallow_clone()], 0.01, 0.001).unwrap();
    assert!(!frozen.grad().defined());
}

#[test]
fn test_clip_grad_norm() {
    let a = param_with_grad(&Tensor::from_slice(&[1.0f32, 1.0]),
                            &Tensor::from_slice(&[3.0f32, 0.0]));
    let b = param_with_grad(&Tensor::from_slice(&[1.0f32]),
                            &Tensor::from_slice(&[4.0f32]));
    let params = [a.shallow_clone(), b.shallow_clone()];
    let total = clip_grad_norm(&params, 10.0);
    assert!((total - 5.0).abs() < 1e-5);
    assert!((b.grad().double_value(&[0]) - 4.0).abs() < 1e-6);

    let total = ClipStrategy::GlobalNorm(1.0).apply(&params).unwrap();
    assert!((total - 5.0).abs() < 1e-5);
    assert!((a.grad().double_value(&[0]) - 0.6).abs() < 1e-5);
    assert!((b.grad().double_value(&[0]) - 0.8).abs() < 1e-5);
}

#[test]
fn test_select() {
    assert_eq!(ClipStrategy::select(true, 10.0, 0.01, 0.001),
               ClipStrategy::Adaptive { clip: 0.01, eps: 0.001 });
    assert_eq!(ClipStrategy::select(false, 10.0, 0.01, 0.001),
               ClipStrategy::GlobalNorm(10.0));
    assert_eq!(ClipStrategy::select(false, 0.0, 0.01, 0.001),
               ClipStrategy::Disabled);
}
