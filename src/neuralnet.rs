use super::*;
use hcpe::{MAX_MOVE_LABEL_NUM, MOVE_LABEL_NUM};
use tch::nn::{self, ModuleT};
use tch::Tensor;

/// what the training loop needs from a network.
pub trait PolicyValueModel {
    /// returns policy logits [B, 2187] and value logit [B, 1].
    fn forward_t(&self, x1 : &Tensor, x2 : &Tensor, train : bool) -> (Tensor, Tensor);
    /// true if the network has no batch normalization.
    fn is_normalizer_free(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NetworkType {
    Resnet10,
    Resnet15,
    Resnet10Swish,
    Resnet20Swish,
    /// residual network without normalization, branches scaled by 0.2.
    /// convolutions are plain, not weight standardized.
    Nfresnet10,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Swish,
}

impl Activation {
    fn apply(&self, xs : &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Swish => xs.silu(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetConfig {
    pub features1 : i64,
    pub features2 : i64,
    pub blocks : usize,
    pub filters : i64,
    pub units : i64,
    pub activation : Activation,
    pub normalizer_free : bool,
}

impl NetworkType {
    pub fn config(&self, features1 : usize, features2 : usize) -> NetConfig {
        let (blocks, filters, activation, normalizer_free) = match self {
            NetworkType::Resnet10 => (10, 192, Activation::Relu, false),
            NetworkType::Resnet15 => (15, 192, Activation::Relu, false),
            NetworkType::Resnet10Swish => (10, 192, Activation::Swish, false),
            NetworkType::Resnet20Swish => (20, 256, Activation::Swish, false),
            NetworkType::Nfresnet10 => (10, 192, Activation::Swish, true),
        };
        NetConfig {
            features1: features1 as i64,
            features2: features2 as i64,
            blocks,
            filters,
            units: 256,
            activation,
            normalizer_free,
        }
    }
}

/// batch normalization, or nothing for normalizer-free networks.
#[derive(Debug)]
struct Norm(Option<nn::BatchNorm>);

impl Norm {
    fn new(vs : nn::Path, c : i64, normalizer_free : bool) -> Self {
        if normalizer_free {
            Norm(None)
        } else {
            Norm(Some(nn::batch_norm2d(vs, c, Default::default())))
        }
    }

    fn forward_t(&self, xs : Tensor, train : bool) -> Tensor {
        match &self.0 {
            Some(bn) => bn.forward_t(&xs, train),
            None => xs,
        }
    }
}

fn conv(vs : nn::Path, cin : i64, cout : i64, ksize : i64, bias : bool) -> nn::Conv2D {
    nn::conv2d(vs, cin, cout, ksize, nn::ConvConfig {
        padding: ksize / 2,
        bias,
        ..Default::default()
    })
}

#[derive(Debug)]
struct ResBlock {
    conv1 : nn::Conv2D,
    norm1 : Norm,
    conv2 : nn::Conv2D,
    norm2 : Norm,
    act : Activation,
    /// scale of the residual branch. 1 with batch normalization.
    alpha : f64,
}

impl ResBlock {
    fn new(vs : &nn::Path, cfg : &NetConfig) -> Self {
        let nf = cfg.normalizer_free;
        Self {
            conv1: conv(vs / "conv1", cfg.filters, cfg.filters, 3, nf),
            norm1: Norm::new(vs / "bn1", cfg.filters, nf),
            conv2: conv(vs / "conv2", cfg.filters, cfg.filters, 3, nf),
            norm2: Norm::new(vs / "bn2", cfg.filters, nf),
            act: cfg.activation,
            alpha: if nf {0.2} else {1.0},
        }
    }

    fn forward_t(&self, xs : &Tensor, train : bool) -> Tensor {
        let h = self.norm1.forward_t(xs.apply(&self.conv1), train);
        let h = self.act.apply(&h);
        let h = self.norm2.forward_t(h.apply(&self.conv2), train);
        self.act.apply(&(h * self.alpha + xs))
    }
}

/// residual policy value network.
#[derive(Debug)]
pub struct PolicyValueNetwork {
    l1_1 : nn::Conv2D,
    l1_2 : nn::Conv2D,
    norm1 : Norm,
    blocks : Vec<ResBlock>,
    policy : nn::Conv2D,
    policy_bias : Tensor,
    value : nn::Conv2D,
    value_norm : Norm,
    value_fc1 : nn::Linear,
    value_fc2 : nn::Linear,
    act : Activation,
    normalizer_free : bool,
}

impl PolicyValueNetwork {
    pub fn new(vs : &nn::Path, cfg : &NetConfig) -> Self {
        let nf = cfg.normalizer_free;
        let blocks = (0..cfg.blocks)
            .map(|i| ResBlock::new(&(vs / format!("block{i}")), cfg))
            .collect();
        Self {
            l1_1: conv(vs / "l1_1", cfg.features1, cfg.filters, 3, nf),
            l1_2: conv(vs / "l1_2", cfg.features2, cfg.filters, 1, false),
            norm1: Norm::new(vs / "norm1", cfg.filters, nf),
            blocks,
            policy: conv(vs / "policy", cfg.filters, MAX_MOVE_LABEL_NUM as i64, 1, false),
            policy_bias: vs.zeros("policy_bias", &[MOVE_LABEL_NUM as i64]),
            value: conv(vs / "value", cfg.filters, MAX_MOVE_LABEL_NUM as i64, 1, nf),
            value_norm: Norm::new(vs / "value_norm", MAX_MOVE_LABEL_NUM as i64, nf),
            value_fc1: nn::linear(vs / "value_fc1",
                MOVE_LABEL_NUM as i64, cfg.units, Default::default()),
            value_fc2: nn::linear(vs / "value_fc2", cfg.units, 1, Default::default()),
            act: cfg.activation,
            normalizer_free: nf,
        }
    }
}

impl PolicyValueModel for PolicyValueNetwork {
    fn forward_t(&self, x1 : &Tensor, x2 : &Tensor, train : bool) -> (Tensor, Tensor) {
        let h = x1.apply(&self.l1_1) + x2.apply(&self.l1_2);
        let mut h = self.act.apply(&self.norm1.forward_t(h, train));
        for block in self.blocks.iter() {
            h = block.forward_t(&h, train);
        }

        let batch = h.size()[0];
        let y1 = h.apply(&self.policy).view((batch, -1)) + &self.policy_bias;

        let v = self.value_norm.forward_t(h.apply(&self.value), train);
        let v = self.act.apply(&v).view((batch, -1));
        let v = self.act.apply(&v.apply(&self.value_fc1));
        let y2 = v.apply(&self.value_fc2);
        (y1, y2)
    }

    fn is_normalizer_free(&self) -> bool {
        self.normalizer_free
    }
}

#[cfg(test)]
pub fn tiny_config(normalizer_free : bool) -> NetConfig {
    NetConfig {
        features1: 4,
        features2: 1,
        blocks: 1,
        filters: 4,
        units: 8,
        activation: if normalizer_free {Activation::Swish} else {Activation::Relu},
        normalizer_free,
    }
}

#[test]
fn test_forward_shape() {
    use tch::{Device, Kind};
    for nf in [false, true] {
        let vs = nn::VarStore::new(Device::Cpu);
        let net = PolicyValueNetwork::new(&vs.root(), &tiny_config(nf));
        assert_eq!(net.is_normalizer_free(), nf);
        let x1 = Tensor::randn([3, 4, 9, 9], (Kind::Float, Device::Cpu));
        let x2 = Tensor::randn([3, 1, 9, 9], (Kind::Float, Device::Cpu));
        let (y1, y2) = net.forward_t(&x1, &x2, true);
        assert_eq!(y1.size(), vec![3, MOVE_LABEL_NUM as i64]);
        assert_eq!(y2.size(), vec![3, 1]);

        let names = vs.variables();
        assert_eq!(names.contains_key("norm1.running_mean"), !nf);
        assert!(names.contains_key("policy_bias"));
    }
}

#[test]
fn test_network_types() {
    let cfg = NetworkType::Nfresnet10.config(62, 57);
    assert!(cfg.normalizer_free);
    assert_eq!(cfg.blocks, 10);
    assert_eq!(cfg.features1, 62);
    assert!(!NetworkType::Resnet20Swish.config(1, 1).normalizer_free);
    assert_eq!(NetworkType::Resnet20Swish.config(1, 1).activation, Activation::Swish);
}
