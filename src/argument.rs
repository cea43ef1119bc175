use super::*;
use clap::Parser;
use neuralnet::NetworkType;

#[derive(Debug, Clone, Parser)]
#[command(version, author, about)]
pub struct Arg {
    /// training data files (hcpe)
    #[arg(required = true, num_args = 1..)]
    pub train_data : Vec<String>,
    /// test data file (hcpe)
    pub test_data : String,
    /// number of positions in each mini-batch
    #[arg(short, long, default_value_t = 1024)]
    pub batchsize : usize,
    /// number of positions in each mini-batch for evaluation
    #[arg(long, default_value_t = 640)]
    pub testbatchsize : usize,
    /// number of epochs to train
    #[arg(short, long, default_value_t = 1)]
    pub epoch : usize,
    /// network architecture
    #[arg(long, value_enum, default_value_t = NetworkType::Resnet10)]
    pub network : NetworkType,
    /// override # of residual blocks of the network.
    #[arg(long)]
    pub blocks : Option<usize>,
    /// override # of filters of the network.
    #[arg(long)]
    pub filters : Option<i64>,
    /// override # of units in the value head.
    #[arg(long)]
    pub units : Option<i64>,
    /// model file name
    #[arg(long, default_value = "model_rl_val_hcpe.safetensors")]
    pub model : String,
    /// state file name
    #[arg(long, default_value = "state_rl_val_hcpe")]
    pub state : String,
    /// initialize the model from given file
    #[arg(short = 'm', long)]
    pub initmodel : Option<String>,
    /// resume the optimization from snapshot
    #[arg(short, long)]
    pub resume : Option<String>,
    /// log file path. stderr if not given.
    #[arg(long)]
    pub log : Option<String>,
    /// learning rate
    #[arg(long, default_value_t = 0.01)]
    pub lr : f64,
    /// weight decay rate
    #[arg(long, default_value_t = 0.0001)]
    pub weightdecay_rate : f64,
    /// max norm of gradients. 0 disables clipping.
    #[arg(long, default_value_t = 10.0)]
    pub clip_grad_max_norm : f64,
    /// clipping ratio of adaptive gradient clipping
    #[arg(long, default_value_t = 0.01)]
    pub agc_clip : f64,
    /// eps of adaptive gradient clipping
    #[arg(long, default_value_t = 0.001)]
    pub agc_eps : f64,
    /// entropy regularization coeff
    #[arg(long, default_value_t = 0.001)]
    pub beta : f64,
    /// regularization factor
    #[arg(long, default_value_t = 0.333)]
    pub val_lambda : f64,
    /// device to process. cuda, mps or cpu. default:cpu.
    #[arg(long, default_value = "cpu")]
    pub device : String,
    /// GPU ID for cuda.
    #[arg(short, long, default_value_t = 0)]
    pub gpu : usize,
    /// evaluation interval in iterations
    #[arg(long, default_value_t = 1000)]
    pub eval_interval : usize,
    /// interval of stochastic weight averaging in iterations
    #[arg(long, default_value_t = 250)]
    pub swa_freq : usize,
    /// max # of averaged snapshots
    #[arg(long, default_value_t = 10)]
    pub swa_n_avr : usize,
    /// learning rate after SWA starts
    #[arg(long)]
    pub swa_lr : Option<f64>,
    /// use automatic mixed precision
    #[arg(long, default_value_t = false)]
    pub use_amp : bool,
    /// random seed for shuffling and sampling.
    #[arg(long)]
    pub seed : Option<u64>,
    /// show ascii graph of the test loss
    #[arg(long, default_value_t = false)]
    pub graph : bool,
    /// hide progress bars
    #[arg(short, long, default_value_t = false)]
    pub quiet : bool,
}

impl Arg {
    /// reject values training can not run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg : String| Err(TrainError::InvalidArgument(msg));
        if self.batchsize == 0 {
            return invalid("batchsize must be positive".to_string());
        }
        if self.testbatchsize == 0 {
            return invalid("testbatchsize must be positive".to_string());
        }
        if self.eval_interval == 0 {
            return invalid("eval-interval must be positive".to_string());
        }
        if self.swa_freq == 0 {
            return invalid("swa-freq must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.val_lambda) {
            return invalid(format!("val-lambda {} is out of [0, 1]", self.val_lambda));
        }
        if self.lr <= 0.0 {
            return invalid(format!("lr {} must be positive", self.lr));
        }
        if let Some(lr) = self.swa_lr {
            if lr <= 0.0 {
                return invalid(format!("swa-lr {lr} must be positive"));
            }
        }
        if self.weightdecay_rate < 0.0 || self.clip_grad_max_norm < 0.0
                || self.agc_clip < 0.0 || self.agc_eps < 0.0 || self.beta < 0.0 {
            return invalid(
                "weightdecay-rate, clip-grad-max-norm, agc-clip, agc-eps \
                 and beta must not be negative".to_string());
        }
        if self.blocks == Some(0) || matches!(self.filters, Some(f) if f <= 0)
                || matches!(self.units, Some(u) if u <= 0) {
            return invalid("blocks, filters and units must be positive".to_string());
        }
        if !["cpu", "cuda", "mps"].contains(&self.device.as_str()) {
            return invalid(format!("unknown device {}", self.device));
        }
        Ok(())
    }
}

#[test]
fn test_parse() {
    let arg = Arg::try_parse_from(
        ["hcpetrain", "a.hcpe", "b.hcpe", "test.hcpe"]).unwrap();
    assert_eq!(arg.train_data, vec!["a.hcpe", "b.hcpe"]);
    assert_eq!(arg.test_data, "test.hcpe");
    assert_eq!(arg.batchsize, 1024);
    assert_eq!(arg.testbatchsize, 640);
    assert_eq!(arg.val_lambda, 0.333);
    assert_eq!(arg.network, NetworkType::Resnet10);
    assert!(arg.swa_lr.is_none());
    assert!(arg.validate().is_ok());

    let arg = Arg::try_parse_from(
        ["hcpetrain", "a.hcpe", "test.hcpe", "-b", "32", "--network", "nfresnet10",
         "--swa-lr", "0.001", "--use-amp", "--eval-interval", "10"]).unwrap();
    assert_eq!(arg.batchsize, 32);
    assert_eq!(arg.network, NetworkType::Nfresnet10);
    assert_eq!(arg.swa_lr, Some(0.001));
    assert!(arg.use_amp);
    assert_eq!(arg.eval_interval, 10);

    // test data is required.
    assert!(Arg::try_parse_from(["hcpetrain", "test.hcpe"]).is_err());
}

#[test]
fn test_validate() {
    let base = Arg::try_parse_from(["hcpetrain", "a.hcpe", "test.hcpe"]).unwrap();
    let check = |f : &dyn Fn(&mut Arg)| {
        let mut arg = base.clone();
        f(&mut arg);
        matches!(arg.validate(), Err(TrainError::InvalidArgument(_)))
    };
    assert!(check(&|a| a.batchsize = 0));
    assert!(check(&|a| a.eval_interval = 0));
    assert!(check(&|a| a.val_lambda = 1.5));
    assert!(check(&|a| a.swa_lr = Some(-1.0)));
    assert!(check(&|a| a.filters = Some(0)));
    assert!(check(&|a| a.device = "tpu".to_string()));
    assert!(!check(&|a| a.clip_grad_max_norm = 0.0));
}
