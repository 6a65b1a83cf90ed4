use std::fmt;
use std::fs::File;
use std::io::{stdout, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::time::Instant;

use structopt::StructOpt;

use tricrf::config::Config;
use tricrf::data::read_records;
use tricrf::evaluate::evaluate;
use tricrf::trainer::mean_log_likelihood;
use tricrf::{Model, ModelKind, Trainer, TricrfError};

const CONFIG_KEYS: &[&str] = &[
    "mode",
    "model-type",
    "train",
    "dev",
    "test",
    "model",
    "output",
    "log",
    "iter",
    "l2",
    "l1",
    "l1-c",
    "init",
    "init-iter",
    "tied-k",
    "prune",
    "confidence",
    "threads",
];

#[derive(Clone, Copy, Debug)]
enum Mode {
    Train,
    Test,
    Both,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            "both" => Ok(Self::Both),
            _ => Err(format!("unknown mode `{s}` (expected train, test, both)")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum ModelType {
    MaxEnt,
    Crf,
    TriCrf1,
    TriCrf2,
    TriCrf3,
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MaxEnt" => Ok(Self::MaxEnt),
            "CRF" => Ok(Self::Crf),
            "TriCRF1" => Ok(Self::TriCrf1),
            "TriCRF2" => Ok(Self::TriCrf2),
            "TriCRF3" => Ok(Self::TriCrf3),
            _ => Err(format!(
                "unknown model type `{s}` (expected MaxEnt, CRF, TriCRF1, TriCRF2, TriCRF3)"
            )),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::MaxEnt => "MaxEnt",
            Self::Crf => "CRF",
            Self::TriCrf1 => "TriCRF1",
            Self::TriCrf2 => "TriCRF2",
            Self::TriCrf3 => "TriCRF3",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug)]
enum Init {
    None,
    Pl,
}

impl FromStr for Init {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "PL" => Ok(Self::Pl),
            _ => Err(format!("unknown initialization `{s}` (expected none, PL)")),
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(
    name = "tricrf",
    about = "Trains and applies triangular-chain CRF models."
)]
struct Opt {
    /// A configuration file whose keys mirror the long flags
    #[structopt(long)]
    config: Option<PathBuf>,

    /// Run mode. {train, test, both}
    #[structopt(long)]
    mode: Option<Mode>,

    /// Model type. {MaxEnt, CRF, TriCRF1, TriCRF2, TriCRF3}
    #[structopt(long = "model-type")]
    model_type: Option<ModelType>,

    /// The training corpus
    #[structopt(long)]
    train: Option<PathBuf>,

    /// A held-out corpus reported after training
    #[structopt(long)]
    dev: Option<PathBuf>,

    /// The test corpus
    #[structopt(long)]
    test: Option<PathBuf>,

    /// The model file to write after training and read before testing
    #[structopt(long)]
    model: Option<PathBuf>,

    /// The file to write predictions to; stdout if absent
    #[structopt(long)]
    output: Option<PathBuf>,

    /// A file that mirrors the progress lines
    #[structopt(long)]
    log: Option<PathBuf>,

    /// The maximum number of optimizer iterations
    #[structopt(long)]
    iter: Option<u64>,

    /// The standard deviation of the Gaussian prior
    #[structopt(long)]
    l2: Option<f64>,

    /// Use orthant-wise L1 penalization instead of the Gaussian prior
    #[structopt(long)]
    l1: bool,

    /// The L1 penalty coefficient
    #[structopt(long = "l1-c")]
    l1_c: Option<f64>,

    /// Weight initialization. {none, PL}
    #[structopt(long)]
    init: Option<Init>,

    /// Pseudo-likelihood warm-start iterations
    #[structopt(long = "init-iter")]
    init_iter: Option<u64>,

    /// Tied-potential threshold for TriCRF3
    #[structopt(long = "tied-k")]
    tied_k: Option<f64>,

    /// Accepted for compatibility; has no effect
    #[structopt(long)]
    prune: Option<f64>,

    /// Emit topic posteriors and per-position marginals
    #[structopt(long)]
    confidence: bool,

    /// Worker threads for objective evaluation
    #[structopt(long)]
    threads: Option<usize>,
}

struct Settings {
    mode: Mode,
    model_type: ModelType,
    train: Option<PathBuf>,
    dev: Option<PathBuf>,
    test: Option<PathBuf>,
    model: Option<PathBuf>,
    output: Option<PathBuf>,
    log: Option<PathBuf>,
    iter: u64,
    l2_sigma: f64,
    l1: bool,
    l1_c: f64,
    init: Init,
    init_iter: u64,
    tied_k: f64,
    confidence: bool,
    threads: usize,
}

fn pick<T: FromStr>(cli: Option<T>, config: &Config, key: &str) -> Result<Option<T>, TricrfError>
where
    <T as FromStr>::Err: fmt::Display,
{
    if cli.is_some() {
        return Ok(cli);
    }
    match config.get(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
            TricrfError::parse(config.line(key).unwrap_or(0), format!("{key}: {e}"))
        }),
        None => Ok(None),
    }
}

fn pick_flag(cli: bool, config: &Config, key: &str) -> Result<bool, TricrfError> {
    if cli {
        return Ok(true);
    }
    Ok(pick::<bool>(None, config, key)?.unwrap_or(false))
}

impl Settings {
    fn resolve(opt: Opt) -> Result<Self, TricrfError> {
        let config = match &opt.config {
            Some(path) => {
                let config = Config::parse(BufReader::new(File::open(path)?))?;
                config.validate(CONFIG_KEYS)?;
                config
            }
            None => Config::default(),
        };
        // The prune threshold is accepted and validated but has no effect.
        let _prune = pick(opt.prune, &config, "prune")?;
        Ok(Self {
            mode: pick(opt.mode, &config, "mode")?.unwrap_or(Mode::Both),
            model_type: pick(opt.model_type, &config, "model-type")?.unwrap_or(ModelType::TriCrf1),
            train: pick(opt.train, &config, "train")?,
            dev: pick(opt.dev, &config, "dev")?,
            test: pick(opt.test, &config, "test")?,
            model: pick(opt.model, &config, "model")?,
            output: pick(opt.output, &config, "output")?,
            log: pick(opt.log, &config, "log")?,
            iter: pick(opt.iter, &config, "iter")?.unwrap_or(100),
            l2_sigma: pick(opt.l2, &config, "l2")?.unwrap_or(20.0),
            l1: pick_flag(opt.l1, &config, "l1")?,
            l1_c: pick(opt.l1_c, &config, "l1-c")?.unwrap_or(1.0),
            init: pick(opt.init, &config, "init")?.unwrap_or(Init::None),
            init_iter: pick(opt.init_iter, &config, "init-iter")?.unwrap_or(30),
            tied_k: pick(opt.tied_k, &config, "tied-k")?.unwrap_or(0.0),
            confidence: pick_flag(opt.confidence, &config, "confidence")?,
            threads: pick(opt.threads, &config, "threads")?.unwrap_or(1),
        })
    }

    fn kind(&self) -> ModelKind {
        match self.model_type {
            ModelType::MaxEnt => ModelKind::MaxEnt,
            ModelType::Crf => ModelKind::Crf,
            ModelType::TriCrf1 => ModelKind::TriPartitioned { tied_k: 0.0 },
            ModelType::TriCrf2 => ModelKind::TriShared,
            ModelType::TriCrf3 => ModelKind::TriPartitioned {
                tied_k: self.tied_k,
            },
        }
    }
}

struct Logger {
    file: Option<File>,
}

impl Logger {
    fn open(path: Option<&PathBuf>) -> Result<Self, TricrfError> {
        let file = match path {
            Some(path) => Some(File::create(path)?),
            None => None,
        };
        Ok(Self { file })
    }

    fn report(&mut self, msg: &str) {
        eprintln!("{msg}");
        if let Some(file) = &mut self.file {
            let _ = writeln!(file, "{msg}");
        }
    }
}

fn train(settings: &Settings, logger: &mut Logger) -> Result<Model, TricrfError> {
    let path = settings
        .train
        .as_ref()
        .ok_or_else(|| TricrfError::invalid_argument("--train is required in this mode"))?;
    let start = Instant::now();
    let records = read_records(BufReader::new(File::open(path)?))?;
    let mut model = Model::new(settings.kind());
    let dataset = model.read_train_records(&records)?;
    model.finalize()?;
    let positions: usize = dataset.iter().map(|s| s.len()).sum();
    logger.report(&format!(
        "Read {} records, {} positions, {} topics, {} parameters",
        dataset.len(),
        positions,
        model.n_topics(),
        model.n_params(),
    ));

    let mut trainer = Trainer::new()
        .max_iter(settings.iter)?
        .n_threads(settings.threads)?;
    trainer = if settings.l1 {
        trainer.l1(settings.l1_c)?
    } else {
        trainer.l2(settings.l2_sigma)?
    };
    if matches!(settings.init, Init::Pl) {
        trainer = trainer.warm_start(settings.init_iter)?;
    }
    logger.report(&format!("Training {} model...", settings.model_type));
    trainer.train(&mut model, &dataset)?;
    logger.report(&format!(
        "Training finished in {:.2} s, mean log-likelihood {:.6}",
        start.elapsed().as_secs_f64(),
        mean_log_likelihood(&model, &dataset, settings.threads)?,
    ));

    if let Some(path) = &settings.dev {
        let records = read_records(BufReader::new(File::open(path)?))?;
        let (dev_set, stats) = model.read_test_records(&records)?;
        logger.report(&format!(
            "Held-out mean log-likelihood {:.6} ({} records; {} unknown features, {} unknown labels, {} unknown topics)",
            mean_log_likelihood(&model, &dev_set, settings.threads)?,
            dev_set.len(),
            stats.unknown_features,
            stats.unknown_labels,
            stats.unknown_topics,
        ));
    }
    Ok(model)
}

fn test(settings: &Settings, model: &Model, logger: &mut Logger) -> Result<(), TricrfError> {
    let path = settings
        .test
        .as_ref()
        .ok_or_else(|| TricrfError::invalid_argument("--test is required in this mode"))?;
    let start = Instant::now();
    let records = read_records(BufReader::new(File::open(path)?))?;
    let (test_set, stats) = model.read_test_records(&records)?;

    let eval = match &settings.output {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            let eval = evaluate(model, &test_set, settings.confidence, Some(&mut writer as &mut dyn Write))?;
            writer.flush()?;
            eval
        }
        None => {
            let out = stdout();
            let mut lock = out.lock();
            evaluate(model, &test_set, settings.confidence, Some(&mut lock as &mut dyn Write))?
        }
    };

    logger.report(&format!(
        "Decoded {} records in {:.2} s ({} unknown features, {} unknown labels, {} unknown topics)",
        eval.seq_total,
        start.elapsed().as_secs_f64(),
        stats.unknown_features,
        stats.unknown_labels,
        stats.unknown_topics,
    ));
    logger.report(&format!(
        "Token accuracy {:.4}, sequence accuracy {:.4}",
        eval.token_accuracy(),
        eval.sequence_accuracy(),
    ));
    if model.kind().is_triangular() {
        logger.report(&format!("Topic accuracy {:.4}", eval.topic_accuracy()));
    }
    logger.report(&format!(
        "Chunk precision {:.4}, recall {:.4}, F1 {:.4}",
        eval.precision(),
        eval.recall(),
        eval.f1(),
    ));
    Ok(())
}

fn save_model(settings: &Settings, model: &Model, logger: &mut Logger) -> Result<(), TricrfError> {
    if let Some(path) = &settings.model {
        let mut writer = BufWriter::new(File::create(path)?);
        model.write(&mut writer)?;
        writer.flush()?;
        logger.report(&format!("Model written to {}", path.display()));
    }
    Ok(())
}

fn load_model(settings: &Settings) -> Result<Model, TricrfError> {
    let path = settings
        .model
        .as_ref()
        .ok_or_else(|| TricrfError::invalid_argument("--model is required in test mode"))?;
    Model::read(BufReader::new(File::open(path)?))
}

fn run(opt: Opt) -> Result<(), TricrfError> {
    let settings = Settings::resolve(opt)?;
    let mut logger = Logger::open(settings.log.as_ref())?;
    match settings.mode {
        Mode::Train => {
            let model = train(&settings, &mut logger)?;
            save_model(&settings, &model, &mut logger)?;
        }
        Mode::Test => {
            let model = load_model(&settings)?;
            test(&settings, &model, &mut logger)?;
        }
        Mode::Both => {
            let model = train(&settings, &mut logger)?;
            save_model(&settings, &model, &mut logger)?;
            test(&settings, &model, &mut logger)?;
        }
    }
    Ok(())
}

fn main() {
    let opt = Opt::from_args();
    if let Err(e) = run(opt) {
        eprintln!("{e}");
        process::exit(e.exit_code());
    }
}
