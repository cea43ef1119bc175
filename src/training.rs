use super::*;

use amp::GradScaler;
use clip::ClipStrategy;
use data_loader::MiniBatch;
use decoder::PositionDecoder;
use hcpe::Hcpe;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use loss::{LossConfig, LossValues};
use neuralnet::{NetConfig, NetworkType, PolicyValueModel, PolicyValueNetwork};
use optimizer::Sgd;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Duration;
use swa::Swa;
use tch::nn::{self, VarStore};
use tch::Device;

const MOMENTUM : f64 = 0.9;

/// running sums of loss values.
#[derive(Debug, Default, Clone, Copy)]
struct LossSum {
    sum : LossValues,
    n : usize,
}

impl LossSum {
    fn add(&mut self, v : &LossValues) {
        self.sum.policy += v.policy;
        self.sum.result += v.result;
        self.sum.value += v.value;
        self.sum.total += v.total;
        self.n += 1;
    }

    fn mean(&self) -> LossValues {
        if self.n == 0 {return LossValues::default();}

        let n = self.n as f64;
        LossValues {
            policy: self.sum.policy / n,
            result: self.sum.result / n,
            value: self.sum.value / n,
            total: self.sum.total / n,
        }
    }
}

/// losses and diagnostics on test data.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub loss : LossValues,
    pub accuracy1 : f64,
    pub accuracy2 : f64,
    pub entropy1 : f64,
    pub entropy2 : f64,
}

impl Evaluation {
    fn add(&mut self, e : &Evaluation) {
        self.loss.policy += e.loss.policy;
        self.loss.result += e.loss.result;
        self.loss.value += e.loss.value;
        self.loss.total += e.loss.total;
        self.accuracy1 += e.accuracy1;
        self.accuracy2 += e.accuracy2;
        self.entropy1 += e.entropy1;
        self.entropy2 += e.entropy2;
    }

    fn mean(&self, n : usize) -> Evaluation {
        if n == 0 {return Evaluation::default();}

        let n = n as f64;
        Evaluation {
            loss: LossValues {
                policy: self.loss.policy / n,
                result: self.loss.result / n,
                value: self.loss.value / n,
                total: self.loss.total / n,
            },
            accuracy1: self.accuracy1 / n,
            accuracy2: self.accuracy2 / n,
            entropy1: self.entropy1 / n,
            entropy2: self.entropy2 / n,
        }
    }
}

/// evaluation on a random test mini batch.
#[derive(Debug, Clone, Copy)]
pub struct IntervalReport {
    pub epoch : usize,
    pub t : usize,
    pub train : LossValues,
    pub test : Evaluation,
}

impl std::fmt::Display for IntervalReport {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        let (tr, te) = (&self.train, &self.test.loss);
        write!(f, "epoch = {}, iteration = {}, \
                   loss = {:.08}, {:.08}, {:.08}, {:.08}, \
                   test loss = {:.08}, {:.08}, {:.08}, {:.08}, \
                   test accuracy = {:.08}, {:.08}",
               self.epoch, self.t,
               tr.policy, tr.result, tr.value, tr.total,
               te.policy, te.result, te.value, te.total,
               self.test.accuracy1, self.test.accuracy2)
    }
}

/// evaluation on the whole test data at the end of an epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochReport {
    pub epoch : usize,
    pub t : usize,
    pub steps : usize,
    pub train : LossValues,
    pub test : Evaluation,
}

impl std::fmt::Display for EpochReport {
    fn fmt(&self, f : &mut std::fmt::Formatter) -> std::fmt::Result {
        let (tr, te) = (&self.train, &self.test.loss);
        write!(f, "epoch = {}, iteration = {}, \
                   train loss avr = {:.08}, {:.08}, {:.08}, {:.08}, \
                   test_loss = {:.08}, {:.08}, {:.08}, {:.08}, \
                   test accuracy = {:.08}, {:.08}, test entropy = {:.08}, {:.08}",
               self.epoch, self.t,
               tr.policy, tr.result, tr.value, tr.total,
               te.policy, te.result, te.value, te.total,
               self.test.accuracy1, self.test.accuracy2,
               self.test.entropy1, self.test.entropy2)
    }
}

/// counters and accumulators of a run.
#[derive(Debug, Default)]
pub struct TrainingStats {
    /// # of finished epochs including resumed ones.
    pub epoch : usize,
    /// # of optimizer steps including resumed ones.
    pub t : usize,
    interval : LossSum,
    epoch_sum : LossSum,
    pub intervals : Vec<IntervalReport>,
    pub epochs : Vec<EpochReport>,
}

impl TrainingStats {
    fn start_epoch(&mut self) {
        self.epoch_sum = LossSum::default();
    }

    fn step(&mut self, losses : &LossValues) {
        self.t += 1;
        self.interval.add(losses);
        self.epoch_sum.add(losses);
    }

    /// report the interval and reset its sums.
    fn interval_report(&mut self, test : Evaluation) -> IntervalReport {
        let report = IntervalReport {
            epoch: self.epoch + 1,
            t: self.t,
            train: self.interval.mean(),
            test,
        };
        self.interval = LossSum::default();
        self.intervals.push(report);
        report
    }

    fn epoch_report(&mut self, test : Evaluation) -> EpochReport {
        let report = EpochReport {
            epoch: self.epoch + 1,
            t: self.t,
            steps: self.epoch_sum.n,
            train: self.epoch_sum.mean(),
            test,
        };
        self.epochs.push(report);
        report
    }
}

/// evaluate `model` on `batch` without gradients.
pub fn evaluate<M : PolicyValueModel>(model : &M, batch : &MiniBatch, cfg : &LossConfig)
        -> Evaluation {
    tch::no_grad(|| {
        let (y1, y2) = model.forward_t(&batch.features1, &batch.features2, false);
        let losses = loss::compose(&y1, &y2, batch, cfg, false);
        Evaluation {
            loss: losses.values(),
            accuracy1: loss::accuracy(&y1, &batch.moves),
            accuracy2: loss::binary_accuracy(&y2, &batch.result),
            entropy1: loss::policy_entropy(&y1),
            entropy2: loss::value_entropy(&y2),
        }
    })
}

pub struct Training {
    train_data : Vec<String>,
    test_data : String,
    batchsize : usize,
    testbatchsize : usize,
    epoch : usize,
    network : NetworkType,
    blocks : Option<usize>,
    filters : Option<i64>,
    units : Option<i64>,
    model : String,
    state : String,
    initmodel : Option<String>,
    resume : Option<String>,
    lr : f64,
    weightdecay_rate : f64,
    clip_grad_max_norm : f64,
    agc_clip : f64,
    agc_eps : f64,
    loss_cfg : LossConfig,
    device : Device,
    eval_interval : usize,
    swa_freq : usize,
    swa_n_avr : usize,
    swa_lr : Option<f64>,
    use_amp : bool,
    decoder : Box<dyn PositionDecoder>,
    rng : StdRng,
    stopwatch : std::time::Instant,
    multibar : MultiProgress,
    quiet : bool,
    show_graph : bool,
    stats : TrainingStats,
}

impl TryFrom<argument::Arg> for Training {
    type Error = TrainError;

    fn try_from(arg : argument::Arg) -> Result<Self> {
        arg.validate()?;

        let device = if arg.device == "mps" && tch::utils::has_mps() {
                Device::Mps
            } else if arg.device == "cuda" && tch::Cuda::is_available() {
                Device::Cuda(arg.gpu)
            } else {
                if arg.device != "cpu" {
                    log::warn!("{} is not available, using cpu", arg.device);
                }
                Device::Cpu
            };
        let rng = match arg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            train_data : arg.train_data,
            test_data : arg.test_data,
            batchsize : arg.batchsize,
            testbatchsize : arg.testbatchsize,
            epoch : arg.epoch,
            network : arg.network,
            blocks : arg.blocks,
            filters : arg.filters,
            units : arg.units,
            model : arg.model,
            state : arg.state,
            initmodel : arg.initmodel,
            resume : arg.resume,
            lr : arg.lr,
            weightdecay_rate : arg.weightdecay_rate,
            clip_grad_max_norm : arg.clip_grad_max_norm,
            agc_clip : arg.agc_clip,
            agc_eps : arg.agc_eps,
            loss_cfg : LossConfig { beta : arg.beta, val_lambda : arg.val_lambda },
            device,
            eval_interval : arg.eval_interval,
            swa_freq : arg.swa_freq,
            swa_n_avr : arg.swa_n_avr,
            swa_lr : arg.swa_lr,
            use_amp : arg.use_amp,
            decoder : Box::new(decoder::HcpBitPlanes),
            rng,
            stopwatch : std::time::Instant::now(),
            multibar : MultiProgress::new(),
            quiet : arg.quiet,
            show_graph : arg.graph,
            stats : TrainingStats::default(),
        })
    }
}

impl Training {
    fn net_config(&self) -> NetConfig {
        let mut cfg = self.network.config(
            self.decoder.features1_num(), self.decoder.features2_num());
        if let Some(blocks) = self.blocks {cfg.blocks = blocks;}
        if let Some(filters) = self.filters {cfg.filters = filters;}
        if let Some(units) = self.units {cfg.units = units;}
        cfg
    }

    fn epochspeed(
        ep : usize, maxepoch : usize, loss : f64, elapsed : Duration) -> String {
        let epoch = ep + 1;
        let speed = elapsed.as_secs_f64() / (epoch) as f64;

        let etasecs = (maxepoch - epoch) as f64 * speed;

        let esthour = (etasecs / 3600.0) as i32;
        let estmin = ((etasecs - esthour as f64 * 3600.0) / 60.0) as i32;
        let estsec = (etasecs % 60.0) as i32;

        let mut res = format!("ep:{epoch:4}/{maxepoch} loss:{loss:.3} ");
        res += &format!("ETA:{esthour:02}h{estmin:02}m{estsec:02}s ");
        res + &if speed > 3600.0 * 1.1 {
                format!("{:.1}hour/epoch", speed / 3600.0)
            } else if speed > 99.0 {
                format!("{:.1}min/epoch", speed / 60.0)
            } else {
                format!("{speed:.1}sec/epoch")
            }
    }

    fn progress_bar(&self, len : u64, chars : &str) -> ProgressBar {
        if self.quiet {
            return ProgressBar::hidden();
        }

        let pb = self.multibar.add(ProgressBar::new(len));
        let style = ProgressStyle::with_template(
                "[{elapsed_precise}]{wide_bar}[{eta_precise}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style.progress_chars(chars));
        pb
    }

    fn start_time(&mut self) {
        self.stopwatch = std::time::Instant::now();
    }

    fn elapsed(&self) -> Duration {
        self.stopwatch.elapsed()
    }

    fn mini_batch(&self, hcpevec : &[Hcpe]) -> Result<MiniBatch> {
        data_loader::mini_batch(hcpevec, self.decoder.as_ref(), self.device)
    }

    /// one optimizer step on `batch`.
    fn train_step<M : PolicyValueModel>(&self, vs : &VarStore, model : &M,
            swa : &mut Swa, scaler : &mut Option<GradScaler>, clip : &ClipStrategy,
            batch : &MiniBatch) -> Result<LossValues> {
        let cfg = self.loss_cfg;
        let losses = amp::autocast(scaler.is_some(), || {
            let (y1, y2) = model.forward_t(&batch.features1, &batch.features2, true);
            loss::compose(&y1, &y2, batch, &cfg, true)
        });

        swa.base.zero_grad(vs);
        let params = vs.trainable_variables();
        match scaler {
            Some(scaler) => {
                scaler.scale_loss(&losses.total).backward();
                scaler.unscale(vs);
                clip.apply(&params)?;
                scaler.step(vs, || swa.step(vs));
                scaler.update();
            },
            None => {
                losses.total.backward();
                clip.apply(&params)?;
                swa.step(vs);
            },
        }
        Ok(losses.values())
    }

    /// average over every full test mini batch.
    fn test_all<M : PolicyValueModel>(&self, model : &M, test : &[Hcpe])
            -> Result<Evaluation> {
        let mut sum = Evaluation::default();
        let mut n = 0;
        for i in data_loader::batch_starts(test.len(), self.testbatchsize) {
            let batch = self.mini_batch(&test[i..i + self.testbatchsize])?;
            sum.add(&evaluate(model, &batch, &self.loss_cfg));
            n += 1;
        }
        Ok(sum.mean(n))
    }

    /// recompute batch normalization statistics on the training data.
    fn bn_update<M : PolicyValueModel>(&self, vs : &VarStore, model : &M,
            train : &[Hcpe]) -> Result<usize> {
        let batches = data_loader::batch_starts(train.len(), self.batchsize).map(|i| {
            self.mini_batch(&train[i..i + self.batchsize])
                .map(|b| (b.features1, b.features2))
        });
        let momentum = nn::BatchNormConfig::default().momentum;
        amp::autocast(self.use_amp, || swa::bn_update(vs, model, batches, momentum))
    }

    #[allow(clippy::too_many_arguments)]
    fn train<M : PolicyValueModel>(&mut self, vs : &VarStore, model : &M,
            swa : &mut Swa, scaler : &mut Option<GradScaler>, clip : &ClipStrategy,
            train : &mut [Hcpe], test : &[Hcpe]) -> Result<()> {
        let pb_epoch = self.progress_bar(self.epoch as u64, "📗📖📓");
        self.start_time();
        for e in 0..self.epoch {
            train.shuffle(&mut self.rng);
            self.stats.start_epoch();

            let pb = self.progress_bar((train.len() / self.batchsize) as u64, "🪵🪓🌴");
            for i in data_loader::batch_starts(train.len(), self.batchsize) {
                let batch = self.mini_batch(&train[i..i + self.batchsize])?;
                let losses = self.train_step(vs, model, swa, scaler, clip, &batch)?;
                self.stats.step(&losses);
                pb.inc(1);

                if self.stats.t % self.eval_interval == 0 {
                    let records = data_loader::sample(test, self.testbatchsize, &mut self.rng);
                    let batch = self.mini_batch(&records)?;
                    let ev = evaluate(model, &batch, &self.loss_cfg);
                    let report = self.stats.interval_report(ev);
                    log::info!("{report}");
                    pb.set_message(format!("test loss:{:.3}", report.test.loss.total));
                }
            }
            pb.finish_and_clear();

            swa.swap_swa_sgd(vs);
            if !model.is_normalizer_free() {
                let n = self.bn_update(vs, model, train)?;
                log::debug!("batch normalization updated with {n} batches");
            }

            let ev = self.test_all(model, test)?;
            let report = self.stats.epoch_report(ev);
            log::info!("{report}");
            log::debug!("{} iterations in epoch {}", report.steps, report.epoch);
            self.stats.epoch += 1;

            if e != self.epoch - 1 {
                swa.swap_swa_sgd(vs);
            }

            pb_epoch.set_message(format!("test loss:{:.3}", ev.loss.total));
            pb_epoch.inc(1);
            log::info!("{}",
                Self::epochspeed(e, self.epoch, ev.loss.total, self.elapsed()));
        }
        pb_epoch.finish();
        Ok(())
    }

    pub fn run(&mut self) -> Result<()> {
        let (vs, swa, scaler) = self.fit()?;
        self.save(&vs, &swa, scaler.as_ref())?;
        self.plot_loss();
        Ok(())
    }

    /// build the network, resume if asked and train all epochs.
    /// returns the variables with SWA weights swapped in.
    fn fit(&mut self) -> Result<(VarStore, Swa, Option<GradScaler>)> {
        log::info!("batchsize={}", self.batchsize);
        log::info!("MomentumSGD(lr={})", self.lr);
        log::info!("WeightDecay(rate={})", self.weightdecay_rate);
        log::info!("entropy regularization coeff={}", self.loss_cfg.beta);
        log::info!("val_lambda={}", self.loss_cfg.val_lambda);

        let mut vs = VarStore::new(self.device);
        let cfg = self.net_config();
        log::info!("network:{:?} {cfg:?}", self.network);
        let model = PolicyValueNetwork::new(&vs.root(), &cfg);
        for (key, t) in vs.variables().iter() {
            log::debug!("{key}:{:?}", t.size());
        }

        let base = Sgd::new(self.lr, MOMENTUM, self.weightdecay_rate, true);
        let mut swa = Swa::new(
            base, self.swa_freq, self.swa_freq, self.swa_lr, self.swa_n_avr);
        let mut scaler = if self.use_amp {
            log::info!("use amp");
            Some(GradScaler::default())
        } else {
            None
        };

        if let Some(path) = &self.initmodel {
            log::info!("load model from {path}");
            checkpoint::load_model(&mut vs, path)?;
        }
        if let Some(path) = &self.resume {
            log::info!("load optimizer state from {path}");
            let state = checkpoint::load_state(
                path, self.device, &mut swa.base, scaler.as_mut())?;
            self.stats.epoch = state.epoch;
            self.stats.t = state.t;
        }

        log::debug!("read training data");
        let mut train = hcpe::load_training_data(&self.train_data)?;
        log::debug!("read test data");
        log::debug!("{}", self.test_data);
        let test = hcpe::read_file(&self.test_data)?;
        log::info!("train position num = {}", train.len());
        log::info!("test position num = {}", test.len());
        if train.len() < self.batchsize {
            return Err(TrainError::InsufficientData {
                what: "training data", len: train.len(), need: self.batchsize });
        }
        if test.len() < self.testbatchsize {
            return Err(TrainError::InsufficientData {
                what: "test data", len: test.len(), need: self.testbatchsize });
        }

        let clip = ClipStrategy::select(model.is_normalizer_free(),
            self.clip_grad_max_norm, self.agc_clip, self.agc_eps);
        log::info!("gradient clipping: {clip:?}");

        self.train(&vs, &model, &mut swa, &mut scaler, &clip, &mut train, &test)?;
        Ok((vs, swa, scaler))
    }

    fn save(&self, vs : &VarStore, swa : &Swa, scaler : Option<&GradScaler>) -> Result<()> {
        log::info!("save the model to {}", self.model);
        checkpoint::save_model(vs, &self.model)?;
        log::info!("save the optimizer state to {}", self.state);
        let state = checkpoint::TrainingState { epoch: self.stats.epoch, t: self.stats.t };
        checkpoint::save_state(&self.state, &state, &swa.base, scaler)
    }

    fn plot_loss(&self) {
        if !self.show_graph || self.stats.intervals.is_empty() {return;}

        let train = self.stats.intervals.iter()
            .map(|r| r.train.total).collect::<Vec<f64>>();
        let test = self.stats.intervals.iter()
            .map(|r| r.test.loss.total).collect::<Vec<f64>>();
        println!("{}",
            rasciigraph::plot_many(
                vec![train, test],
                rasciigraph::Config::default()
                    .with_height(10)
                    .with_width(40)
                    .with_caption("loss history (train, test)".to_string())
                ));
    }
}

#[cfg(test)]
fn write_records(dir : &tempfile::TempDir, name : &str, n : usize) -> String {
    let path = dir.path().join(name);
    let path = path.to_str().unwrap().to_string();
    hcpe::write_file(&path, &data_loader::synthetic(n)).unwrap();
    path
}

#[cfg(test)]
fn tiny_arg(dir : &tempfile::TempDir, train : &str, test : &str, extra : &[&str])
        -> argument::Arg {
    use clap::Parser;
    let model = dir.path().join("model.ot");
    let state = dir.path().join("state.ot");
    let mut args = vec![
        "hcpetrain", train, test,
        "--blocks", "1", "--filters", "4", "--units", "8",
        "--model", model.to_str().unwrap(), "--state", state.to_str().unwrap(),
        "--seed", "1", "--quiet",
    ].into_iter().map(String::from).collect::<Vec<_>>();
    args.extend(extra.iter().map(|s| s.to_string()));
    argument::Arg::try_parse_from(args).unwrap()
}

#[test]
fn test_epochspeed() {
    let s = Training::epochspeed(0, 3, 1.23456, Duration::from_secs(30));
    assert_eq!(s, "ep:   1/3 loss:1.235 ETA:00h01m00s 30.0sec/epoch");
    let s = Training::epochspeed(1, 4, 0.5, Duration::from_secs(7200));
    assert_eq!(s, "ep:   2/4 loss:0.500 ETA:02h00m00s 60.0min/epoch");
}

#[test]
fn test_stats() {
    let mut stats = TrainingStats::default();
    stats.start_epoch();
    let l = |v : f64| LossValues { policy: v, result: v, value: v, total: v };
    stats.step(&l(1.0));
    stats.step(&l(3.0));
    let r = stats.interval_report(Evaluation::default());
    assert_eq!(r.t, 2);
    assert_eq!(r.epoch, 1);
    assert_eq!(r.train.total, 2.0);
    stats.step(&l(5.0));
    let r = stats.interval_report(Evaluation::default());
    assert_eq!(r.train.total, 5.0);

    let r = stats.epoch_report(Evaluation::default());
    assert_eq!(r.steps, 3);
    assert_eq!(r.train.total, 3.0);
    assert_eq!(stats.intervals.len(), 2);
    assert_eq!(stats.epochs.len(), 1);
    assert!(format!("{r}").starts_with("epoch = 1, iteration = 3, train loss avr = 3.00000000"));
}

#[test]
fn test_run_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let train = write_records(&dir, "train.hcpe", 2048);
    let test = write_records(&dir, "test.hcpe", 640);
    let extra = ["--network", "nfresnet10", "--eval-interval", "1", "--swa-freq", "1"];

    let mut training = Training::try_from(tiny_arg(&dir, &train, &test, &extra)).unwrap();
    training.run().unwrap();
    let stats = &training.stats;
    assert_eq!(stats.t, 2);
    assert_eq!(stats.epoch, 1);
    // each interval report is logged as one line.
    assert_eq!(stats.intervals.len(), 2);
    assert!(stats.intervals.iter().zip([1, 2])
        .all(|(r, t)| format!("{r}").starts_with(&format!("epoch = 1, iteration = {t}, loss = "))));
    assert_eq!(stats.epochs.len(), 1);
    assert_eq!(stats.epochs[0].steps, 2);
    assert!(stats.epochs[0].test.loss.total.is_finite());
    assert!(dir.path().join("model.ot").exists());
    assert!(dir.path().join("state.ot").exists());

    // resume from the saved files.
    let model = dir.path().join("model.ot");
    let state = dir.path().join("state.ot");
    let mut extra = extra.to_vec();
    extra.extend(["--initmodel", model.to_str().unwrap(),
                  "--resume", state.to_str().unwrap()]);
    let mut training = Training::try_from(tiny_arg(&dir, &train, &test, &extra)).unwrap();
    training.run().unwrap();
    assert_eq!(training.stats.epoch, 2);
    assert_eq!(training.stats.t, 4);
    assert_eq!(training.stats.epochs[0].epoch, 2);
}

#[test]
fn test_run_batch_norm() {
    let dir = tempfile::tempdir().unwrap();
    let train = write_records(&dir, "train.hcpe", 300);
    let missing = dir.path().join("missing.hcpe");
    let test = write_records(&dir, "test.hcpe", 100);
    let extra = ["-b", "64", "--testbatchsize", "32", "--epoch", "2",
                 "--eval-interval", "3", "--swa-freq", "2"];
    let mut arg = tiny_arg(&dir, missing.to_str().unwrap(), &test, &extra);
    arg.train_data.push(train);

    let mut training = Training::try_from(arg).unwrap();
    training.run().unwrap();
    let stats = &training.stats;
    // 300 / 64 = 4 steps per epoch.
    assert_eq!(stats.t, 8);
    assert_eq!(stats.intervals.len(), 2);
    assert_eq!(stats.epochs.iter().map(|e| e.steps).collect::<Vec<_>>(), vec![4, 4]);
    assert!(stats.epochs.iter().all(|e| e.test.loss.total.is_finite()));
}

#[test]
fn test_insufficient_data() {
    let dir = tempfile::tempdir().unwrap();
    let train = write_records(&dir, "train.hcpe", 100);
    let test = write_records(&dir, "test.hcpe", 100);
    let mut training = Training::try_from(
        tiny_arg(&dir, &train, &test, &["-b", "128"])).unwrap();
    assert!(matches!(training.run(),
        Err(TrainError::InsufficientData { what: "training data", len: 100, need: 128 })));

    let mut training = Training::try_from(tiny_arg(&dir, &train, &test, &["-b", "64"])).unwrap();
    assert!(matches!(training.run(),
        Err(TrainError::InsufficientData { what: "test data", .. })));

    let missing = dir.path().join("none.hcpe");
    let mut training = Training::try_from(
        tiny_arg(&dir, missing.to_str().unwrap(), &test, &[])).unwrap();
    assert!(matches!(training.run(), Err(TrainError::NoTrainingData(_))));
}

#[test]
fn test_amp_run_keeps_averaged_weights() {
    let dir = tempfile::tempdir().unwrap();
    let train = write_records(&dir, "train.hcpe", 3072);
    let test = write_records(&dir, "test.hcpe", 640);
    let extra = ["--network", "nfresnet10", "--use-amp", "--swa-freq", "1",
                 "--eval-interval", "100"];
    let mut training = Training::try_from(tiny_arg(&dir, &train, &test, &extra)).unwrap();
    let (vs, mut swa, scaler) = training.fit().unwrap();
    assert_eq!(training.stats.t, 3);
    // averaged at steps 2 and 3.
    assert_eq!(swa.n_avg(), 2);
    let scaler = scaler.unwrap();
    assert!(scaler.scale() > 0.0);

    let averaged = vs.variables().into_iter()
        .map(|(k, v)| (k, v.copy())).collect::<std::collections::HashMap<_, _>>();
    training.save(&vs, &swa, Some(&scaler)).unwrap();

    // the saved model holds the averaged weights.
    let mut saved = VarStore::new(Device::Cpu);
    let cfg = training.net_config();
    let _net = PolicyValueNetwork::new(&saved.root(), &cfg);
    checkpoint::load_model(&mut saved, dir.path().join("model.ot").to_str().unwrap()).unwrap();
    for (name, t) in saved.variables() {
        assert!(t.equal(&averaged[&name]), "{name}");
    }

    // swapping back restores the last SGD weights, which differ.
    swa.swap_swa_sgd(&vs);
    assert!(vs.variables().iter().any(|(name, t)| !t.equal(&averaged[name])));

    let mut restored = GradScaler::default();
    restored.load(1.0, 0);
    let state = checkpoint::load_state(dir.path().join("state.ot").to_str().unwrap(),
        Device::Cpu, &mut Sgd::new(0.1, 0.9, 0.0, true), Some(&mut restored)).unwrap();
    assert_eq!(state.t, 3);
    assert_eq!(restored.scale(), scaler.scale());
}
