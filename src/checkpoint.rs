use super::*;
use amp::GradScaler;
use optimizer::Sgd;
use tch::nn::VarStore;
use tch::{Device, Tensor};

const KEY_EPOCH : &str = "epoch";
const KEY_T : &str = "t";
const KEY_LR : &str = "optimizer.lr";
const PREFIX_MOMENTUM : &str = "optimizer.momentum_buffer.";
const KEY_SCALE : &str = "scaler.scale";
const KEY_GROWTH : &str = "scaler.growth_tracker";

/// counters stored with the optimizer state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrainingState {
    pub epoch : usize,
    pub t : usize,
}

pub fn save_model(vs : &VarStore, path : &str) -> Result<()> {
    vs.save(path).map_err(|e| TrainError::Checkpoint {
        path: path.to_string(), reason: e.to_string() })
}

pub fn load_model(vs : &mut VarStore, path : &str) -> Result<()> {
    vs.load(path).map_err(|e| TrainError::Checkpoint {
        path: path.to_string(), reason: e.to_string() })
}

/// store counters, optimizer and scaler state in `path`.
pub fn save_state(path : &str, state : &TrainingState, optimizer : &Sgd,
        scaler : Option<&GradScaler>) -> Result<()> {
    let mut named = vec![
        (KEY_EPOCH.to_string(), Tensor::from_slice(&[state.epoch as i64])),
        (KEY_T.to_string(), Tensor::from_slice(&[state.t as i64])),
        (KEY_LR.to_string(), Tensor::from_slice(&[optimizer.lr])),
    ];
    for (name, buf) in optimizer.buffers() {
        named.push((format!("{PREFIX_MOMENTUM}{name}"), buf.to_device(Device::Cpu)));
    }
    if let Some(scaler) = scaler {
        named.push((KEY_SCALE.to_string(), Tensor::from_slice(&[scaler.scale()])));
        named.push((KEY_GROWTH.to_string(),
                    Tensor::from_slice(&[scaler.growth_tracker()])));
    }
    Tensor::save_multi(&named, path).map_err(|e| TrainError::Checkpoint {
        path: path.to_string(), reason: e.to_string() })
}

/// restore what `save_state` stored.
/// scaler state is restored only when both `scaler` and the file have it.
pub fn load_state(path : &str, device : Device, optimizer : &mut Sgd,
        scaler : Option<&mut GradScaler>) -> Result<TrainingState> {
    let err = |reason : String| TrainError::Checkpoint { path: path.to_string(), reason };
    let named = Tensor::load_multi(path).map_err(|e| err(e.to_string()))?;

    let find = |key : &str| named.iter().find(|(k, _)| k == key).map(|(_, t)| t);
    let epoch = find(KEY_EPOCH).ok_or_else(|| err(format!("{KEY_EPOCH} is missing")))?;
    let t = find(KEY_T).ok_or_else(|| err(format!("{KEY_T} is missing")))?;
    let state = TrainingState {
        epoch: epoch.int64_value(&[0]) as usize,
        t: t.int64_value(&[0]) as usize,
    };
    if let Some(lr) = find(KEY_LR) {
        optimizer.set_lr(lr.double_value(&[0]));
    }
    for (key, buf) in named.iter() {
        if let Some(name) = key.strip_prefix(PREFIX_MOMENTUM) {
            optimizer.set_buffer(name, buf.to_device(device));
        }
    }
    if let (Some(scaler), Some(scale), Some(growth)) =
            (scaler, find(KEY_SCALE), find(KEY_GROWTH)) {
        scaler.load(scale.double_value(&[0]), growth.int64_value(&[0]));
    }
    Ok(state)
}

#[test]
fn test_state_round_trip() {
    use tch::Kind;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.ot");
    let path = path.to_str().unwrap();

    let vs = VarStore::new(Device::Cpu);
    let w = vs.root().var_copy("layer.w", &Tensor::from_slice(&[1.0f32, 2.0]));
    let mut opt = Sgd::new(0.05, 0.9, 1e-4, true);
    (&w * 3.0).sum(Kind::Float).backward();
    opt.step(&vs);
    let mut scaler = GradScaler::new(1024.0);
    scaler.load(1024.0, 17);

    let state = TrainingState { epoch: 3, t: 1234 };
    save_state(path, &state, &opt, Some(&scaler)).unwrap();

    let mut opt2 = Sgd::new(0.01, 0.9, 1e-4, true);
    let mut scaler2 = GradScaler::default();
    let loaded = load_state(path, Device::Cpu, &mut opt2, Some(&mut scaler2)).unwrap();
    assert_eq!(loaded, state);
    assert_eq!(opt2.lr, 0.05);
    assert!(opt2.buffers()["layer.w"].equal(&opt.buffers()["layer.w"]));
    assert_eq!(scaler2, scaler);

    // without scaler in the file.
    save_state(path, &state, &opt, None).unwrap();
    let mut scaler3 = GradScaler::default();
    load_state(path, Device::Cpu, &mut opt2, Some(&mut scaler3)).unwrap();
    assert_eq!(scaler3, GradScaler::default());
}

#[test]
fn test_model_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.ot");
    let path = path.to_str().unwrap();

    let vs = VarStore::new(Device::Cpu);
    let net = neuralnet::PolicyValueNetwork::new(&vs.root(), &neuralnet::tiny_config(true));
    save_model(&vs, path).unwrap();

    let mut vs2 = VarStore::new(Device::Cpu);
    let _net2 = neuralnet::PolicyValueNetwork::new(&vs2.root(), &neuralnet::tiny_config(true));
    load_model(&mut vs2, path).unwrap();
    let a = vs.variables();
    let b = vs2.variables();
    for (name, t) in a.iter() {
        assert!(t.equal(&b[name]), "{name}");
    }
    drop(net);

    assert!(matches!(load_state("/nonexistent/state", Device::Cpu,
                                &mut Sgd::new(0.1, 0.0, 0.0, false), None),
                     Err(TrainError::Checkpoint { .. })));
}
