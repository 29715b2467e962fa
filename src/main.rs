use clap::{Args as ClapArgs, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap_complete::{Shell, generate};
use cryptonic::config::{DEFAULT_MODEL_CONFIG, Overrides, ResolvedConfig, load_config};
use cryptonic::data::download_history;
use cryptonic::evaluation::MetricRequest;
use cryptonic::fetch;
use cryptonic::forecast::write_forecast_csv;
use cryptonic::payload::{ModelStatus, PredictPayload, StatusPayload};
use cryptonic::{
    CsvSource, DataSource, Forecaster, LinearSequenceModel, PreparedSeries, SequenceModel,
};
use tracing_subscriber::EnvFilter;

const APP_ABOUT: &str = "cryptonic - windowed price forecasting for crypto assets";
const DEFAULT_HISTORY_CSV: &str = "dist/history.csv";
const DEFAULT_FORECAST_CSV: &str = "dist/forecast.csv";
const DEFAULT_MODEL_DIR: &str = "models";
const DEFAULT_MODEL_NAME: &str = "bitcoin";
const MODEL_EXTENSION: &str = "json.gz";
const FETCH_MAX_RETRIES: u32 = 10;
const FETCH_DELAY_SECS: u64 = 2;

#[derive(Parser, Debug)]
#[command(name = "cryptonic", about = APP_ABOUT, version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Параметры, общие для команд, которые работают с моделью.
#[derive(ClapArgs, Debug, Clone)]
struct PipelineArgs {
    /// TOML-файл с параметрами данных, окон и обучения.
    #[arg(
        long = "model-config",
        value_name = "PATH",
        default_value = DEFAULT_MODEL_CONFIG
    )]
    model_config: PathBuf,
    /// Имя модели; файл модели — `<model-dir>/<name>.json.gz`.
    #[arg(
        long = "model-name",
        env = "MODEL_NAME",
        value_name = "NAME",
        default_value = DEFAULT_MODEL_NAME
    )]
    model_name: String,
    /// Директория с файлами моделей.
    #[arg(long = "model-dir", value_name = "PATH", default_value = DEFAULT_MODEL_DIR)]
    model_dir: PathBuf,
    /// Длина группы (периода прогноза) в днях, поверх конфигурации.
    #[arg(long = "period-length", env = "PERIOD_SIZE", value_name = "DAYS")]
    period_length: Option<usize>,
    /// Число эпох обучения, поверх конфигурации.
    #[arg(long = "epochs", env = "EPOCHS", value_name = "N")]
    epochs: Option<u64>,
    /// Сколько последних групп отложить для оценки.
    #[arg(long = "holdout", value_name = "GROUPS")]
    holdout: Option<usize>,
}

impl PipelineArgs {
    fn model_path(&self) -> PathBuf {
        self.model_dir
            .join(format!("{}.{MODEL_EXTENSION}", self.model_name))
    }

    fn resolve(&self) -> Result<ResolvedConfig, String> {
        let mut cfg = load_config(&self.model_config)?;
        cfg.apply(Overrides {
            period_length: self.period_length,
            holdout: self.holdout,
            epochs: self.epochs,
        });
        cfg.validate()
            .map_err(|err| format!("Invalid configuration: {err}"))?;
        Ok(cfg)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Полный режим: скачать данные, обучить и сохранить модель, сохранить прогноз.
    Run {
        /// Куда сохранить CSV с историческими данными.
        #[arg(
            long = "output-history-csv",
            value_name = "PATH",
            default_value = DEFAULT_HISTORY_CSV
        )]
        output_history_csv: PathBuf,
        /// Куда сохранить CSV с прогнозом.
        #[arg(
            long = "output-forecast-csv",
            value_name = "PATH",
            default_value = DEFAULT_FORECAST_CSV
        )]
        output_forecast_csv: PathBuf,
        /// Куда сохранить JSON-ответ (если не указано — stdout).
        #[arg(long = "output-json", value_name = "PATH")]
        output_json: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Скачать историю цен и сохранить CSV.
    Download {
        /// Куда сохранить CSV.
        #[arg(
            short = 'o',
            long = "output-csv",
            value_name = "PATH",
            default_value = DEFAULT_HISTORY_CSV
        )]
        output_csv: PathBuf,
        /// TOML-файл с параметрами (используется секция `[data]`).
        #[arg(
            long = "model-config",
            value_name = "PATH",
            default_value = DEFAULT_MODEL_CONFIG
        )]
        model_config: PathBuf,
    },
    /// Обучить модель на CSV и сохранить её.
    Train {
        /// CSV с историческими данными.
        #[arg(
            short = 'c',
            long = "csv",
            value_name = "PATH",
            default_value = DEFAULT_HISTORY_CSV
        )]
        csv: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Прогноз на следующий период сохранённой моделью.
    Predict {
        /// CSV с историческими данными.
        #[arg(
            short = 'c',
            long = "csv",
            value_name = "PATH",
            default_value = DEFAULT_HISTORY_CSV
        )]
        csv: PathBuf,
        /// Куда сохранить CSV с прогнозом.
        #[arg(
            long = "output-csv",
            value_name = "PATH",
            default_value = DEFAULT_FORECAST_CSV
        )]
        output_csv: PathBuf,
        /// Куда сохранить JSON-ответ (если не указано — stdout).
        #[arg(long = "output-json", value_name = "PATH")]
        output_json: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Состояние сохранённой модели и её ошибки.
    Status {
        /// CSV с историческими данными.
        #[arg(
            short = 'c',
            long = "csv",
            value_name = "PATH",
            default_value = DEFAULT_HISTORY_CSV
        )]
        csv: PathBuf,
        /// Куда сохранить JSON-ответ (если не указано — stdout).
        #[arg(long = "output-json", value_name = "PATH")]
        output_json: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Сгенерировать файлы автодополнения для shell.
    Completions {
        /// Целевой shell.
        #[arg(value_enum)]
        shell: Shell,
        /// Куда сохранить файл (если не указано — stdout).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn create_parent(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
    }
    Ok(())
}

fn generate_completions(shell: Shell, output: Option<PathBuf>) -> Result<(), String> {
    let mut cmd = Args::command();
    let bin_name = cmd.get_name().to_string();
    if let Some(path) = output {
        create_parent(&path)?;
        let mut file = File::create(&path)
            .map_err(|err| format!("Failed to create {}: {err}", path.display()))?;
        generate(shell, &mut cmd, bin_name, &mut file);
    } else {
        let mut stdout = std::io::stdout();
        generate(shell, &mut cmd, bin_name, &mut stdout);
    }
    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cryptonic=info"));
    let ansi = std::io::stdout().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .compact()
        .init();
}

fn headline(message: &str) {
    tracing::info!(status = "start", "{message}");
}

fn info(message: &str) {
    tracing::info!(status = "info", "{message}");
}

fn success(message: &str) {
    tracing::info!(status = "ok", "{message}");
}

fn error(message: &str) {
    tracing::error!(status = "err", "{message}");
}

async fn download_to_csv(cfg: &ResolvedConfig, output_csv: &Path) -> Result<usize, String> {
    let delay = Duration::from_secs(FETCH_DELAY_SECS);
    let client = fetch::build_client()?;
    download_history(&client, &cfg.data, output_csv, FETCH_MAX_RETRIES, delay).await
}

fn prepare_series(csv: &Path, cfg: &ResolvedConfig) -> Result<PreparedSeries, String> {
    let series = CsvSource::new(csv, &cfg.data.variable)
        .fetch()
        .map_err(|err| format!("Failed to read history CSV {}: {err}", csv.display()))?;
    PreparedSeries::build(series, cfg.windowing).map_err(|err| err.to_string())
}

fn train_and_save(
    csv: &Path,
    cfg: &ResolvedConfig,
    model_path: &Path,
) -> Result<Forecaster<LinearSequenceModel>, String> {
    let prepared = prepare_series(csv, cfg)?;
    let model = LinearSequenceModel::new(cfg.windowing.group_size, cfg.model)
        .with_normalize(cfg.windowing.normalize);
    let mut forecaster = Forecaster::new(model, prepared);
    forecaster
        .train(None, cfg.training)
        .map_err(|err| format!("Failed to train model: {err}"))?;
    forecaster
        .save(model_path)
        .map_err(|err| format!("Failed to save model {}: {err}", model_path.display()))?;
    success(&format!("Saved model to {}", model_path.display()));
    Ok(forecaster)
}

fn load_forecaster(
    csv: &Path,
    cfg: &ResolvedConfig,
    model_path: &Path,
) -> Result<Forecaster<LinearSequenceModel>, String> {
    let model = LinearSequenceModel::load(model_path).map_err(|err| err.to_string())?;
    model
        .check_settings(&cfg.windowing)
        .map_err(|err| format!("Model {} does not fit the configuration: {err}", model_path.display()))?;
    let prepared = prepare_series(csv, cfg)?;
    Ok(Forecaster::new(model, prepared))
}

fn emit_json<T: Serialize>(payload: &T, output: Option<&Path>) -> Result<(), String> {
    let json = serde_json::to_string_pretty(payload)
        .map_err(|err| format!("Failed to serialize payload: {err}"))?;
    match output {
        Some(path) => {
            create_parent(path)?;
            fs::write(path, json)
                .map_err(|err| format!("Failed to write {}: {err}", path.display()))?;
            success(&format!("Saved JSON to {}", path.display()));
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn predict(
    forecaster: &Forecaster<LinearSequenceModel>,
    output_csv: &Path,
    output_json: Option<&Path>,
) -> Result<(), String> {
    let period_length = forecaster.prepared().settings().group_size;
    let forecast = forecaster
        .forecast()
        .map_err(|err| format!("Failed to forecast: {err}"))?;
    write_forecast_csv(&forecast, output_csv)
        .map_err(|err| format!("Failed to write forecast CSV: {err}"))?;
    success(&format!("Saved forecast to {}", output_csv.display()));
    emit_json(
        &PredictPayload::new(period_length, forecast.records()),
        output_json,
    )
}

fn status(
    forecaster: &Forecaster<LinearSequenceModel>,
    name: &str,
    output_json: Option<&Path>,
) -> Result<(), String> {
    let last_trained = forecaster
        .last_trained()
        .or_else(|| forecaster.model().last_trained());
    let payload = match forecaster.evaluate(&MetricRequest::defaults()) {
        Ok(error_rates) => {
            for (metric, value) in error_rates.iter() {
                tracing::info!(metric = metric.name(), value, "Model error rate");
            }
            StatusPayload::new(ModelStatus {
                name: name.to_string(),
                last_trained,
                error_rates,
            })
        }
        Err(err) => {
            tracing::warn!(error = %err, "Failed to evaluate model");
            StatusPayload::failure(
                ModelStatus {
                    name: name.to_string(),
                    last_trained,
                    error_rates: cryptonic::Evaluation::default(),
                },
                err.to_string(),
            )
        }
    };
    emit_json(&payload, output_json)
}

async fn run_pipeline(
    pipeline: &PipelineArgs,
    output_history_csv: &Path,
    output_forecast_csv: &Path,
    output_json: Option<&Path>,
) -> Result<(), String> {
    let cfg = pipeline.resolve()?;
    let model_path = pipeline.model_path();
    tracing::info!(
        mode = "run",
        model = %pipeline.model_name,
        ticker = %cfg.data.ticker,
        period_length = cfg.windowing.group_size,
        holdout = cfg.windowing.holdout,
        epochs = cfg.training.epochs,
        model_config_path = %pipeline.model_config.display(),
        output_history_csv = %output_history_csv.display(),
        output_forecast_csv = %output_forecast_csv.display(),
        "Starting full pipeline"
    );
    info(&format!(
        "Saving history CSV to {}",
        output_history_csv.display()
    ));
    let days = download_to_csv(&cfg, output_history_csv).await?;
    success(&format!("Downloaded {days} days of history"));

    let forecaster = train_and_save(output_history_csv, &cfg, &model_path)?;
    predict(&forecaster, output_forecast_csv, output_json)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let result = match args.command {
        Command::Completions { shell, output } => {
            if let Err(err) = generate_completions(shell, output) {
                eprintln!("{err}");
            }
            return;
        }
        Command::Run {
            output_history_csv,
            output_forecast_csv,
            output_json,
            pipeline,
        } => {
            init_logging();
            headline(APP_ABOUT);
            run_pipeline(
                &pipeline,
                &output_history_csv,
                &output_forecast_csv,
                output_json.as_deref(),
            )
            .await
        }
        Command::Download {
            output_csv,
            model_config,
        } => {
            init_logging();
            headline(APP_ABOUT);
            tracing::info!(
                mode = "download",
                output_csv = %output_csv.display(),
                "Downloading price history"
            );
            match load_config(&model_config) {
                Ok(cfg) => {
                    info(&format!("Saving CSV to {}", output_csv.display()));
                    download_to_csv(&cfg, &output_csv).await.map(|days| {
                        success(&format!(
                            "Saved {days} days to {}",
                            output_csv.display()
                        ));
                    })
                }
                Err(err) => Err(err),
            }
        }
        Command::Train { csv, pipeline } => {
            init_logging();
            headline(APP_ABOUT);
            pipeline.resolve().and_then(|cfg| {
                tracing::info!(
                    mode = "train",
                    model = %pipeline.model_name,
                    input_csv = %csv.display(),
                    period_length = cfg.windowing.group_size,
                    epochs = cfg.training.epochs,
                    "Training sequence model"
                );
                train_and_save(&csv, &cfg, &pipeline.model_path()).map(|_| ())
            })
        }
        Command::Predict {
            csv,
            output_csv,
            output_json,
            pipeline,
        } => {
            init_logging();
            headline(APP_ABOUT);
            pipeline.resolve().and_then(|cfg| {
                tracing::info!(
                    mode = "predict",
                    model = %pipeline.model_name,
                    input_csv = %csv.display(),
                    output_csv = %output_csv.display(),
                    "Forecasting next period"
                );
                let forecaster = load_forecaster(&csv, &cfg, &pipeline.model_path())?;
                predict(&forecaster, &output_csv, output_json.as_deref())
            })
        }
        Command::Status {
            csv,
            output_json,
            pipeline,
        } => {
            init_logging();
            headline(APP_ABOUT);
            pipeline.resolve().and_then(|cfg| {
                tracing::info!(
                    mode = "status",
                    model = %pipeline.model_name,
                    input_csv = %csv.display(),
                    holdout = cfg.windowing.holdout,
                    "Evaluating sequence model"
                );
                let forecaster = load_forecaster(&csv, &cfg, &pipeline.model_path())?;
                status(&forecaster, &pipeline.model_name, output_json.as_deref())
            })
        }
    };

    if let Err(err) = result {
        error(&err);
    }
}
