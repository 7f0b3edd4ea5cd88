use slipway_cli::cli::commands::{
    BuildArgs, CliArgs, Commands, HealthArgs, ImagesArgs, InspectArgs, PlanArgs, PruneArgs,
    RenderArgs, RunArgs, SourceArgs,
};
use slipway_cli::cli::output::{HealthStatus, OutputFormat, OutputFormatter};
use slipway_cli::{NAME, VERSION};
use slipway_core::config::{ImageSourceKind, SlipwayConfig};
use slipway_core::descriptor::{dockerfile, BuildDescriptor};
use slipway_core::progress::{LoggingHandler, NoOpHandler, ProgressHandler};
use slipway_pipeline::runtime::materialise;
use slipway_pipeline::{
    image_source, launch, BuildEngine, BuildPlan, LaunchSpec, LayerStore, PipInstaller,
    RunOverrides,
};

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Descriptor files looked up in the context, in order
const DESCRIPTOR_CANDIDATES: &[&str] = &["slipway.yaml", "slipway.yml", "slipway.toml"];
const DOCKER_HINT: &str = "Start the Docker daemon or set SLIPWAY_IMAGE_SOURCE=pinned";

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    init_logging_from_args(&args);

    debug!("{} v{} starting", NAME, VERSION);
    debug!("Arguments: {:?}", args);

    let exit_code = match &args.command {
        Commands::Plan(plan_args) => handle_plan(plan_args),
        Commands::Render(render_args) => handle_render(render_args, args.quiet),
        Commands::Build(build_args) => handle_build(build_args, args.quiet).await,
        Commands::Run(run_args) => handle_run(run_args).await,
        Commands::Inspect(inspect_args) => handle_inspect(inspect_args),
        Commands::Images(images_args) => handle_images(images_args),
        Commands::Prune(prune_args) => handle_prune(prune_args),
        Commands::Health(health_args) => handle_health(health_args).await,
        Commands::Schema => handle_schema(),
    };

    process::exit(exit_code);
}

fn init_logging_from_args(args: &CliArgs) {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let level = if let Some(level_str) = &args.log_level {
            parse_level(level_str)
        } else if args.verbose {
            Level::DEBUG
        } else if args.quiet {
            Level::ERROR
        } else {
            let level_str = env::var("SLIPWAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
            parse_level(&level_str)
        };

        let mut filter = EnvFilter::from_default_env();

        if env::var("RUST_LOG").is_err() {
            for directive in [
                format!("slipway={}", level),
                format!("slipway_core={}", level),
                format!("slipway_pipeline={}", level),
                format!("slipway_cli={}", level),
                "bollard=warn".to_string(),
                "h2=warn".to_string(),
                "hyper=warn".to_string(),
                "reqwest=warn".to_string(),
            ] {
                if let Ok(directive) = directive.parse() {
                    filter = filter.add_directive(directive);
                }
            }
        }

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    });
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        }
    }
}

/// Resolve the context directory and load its descriptor
fn load_source(source: &SourceArgs) -> Result<(PathBuf, BuildDescriptor)> {
    let context = match &source.context {
        Some(path) => path.clone(),
        None => env::current_dir().context("Failed to get current directory")?,
    };
    if !context.is_dir() {
        anyhow::bail!("Build context is not a directory: {}", context.display());
    }
    let context = context
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize {}", context.display()))?;
    debug!("Build context: {}", context.display());

    let descriptor = if let Some(path) = &source.dockerfile {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read Dockerfile {}", path.display()))?;
        dockerfile::parse(&content)
            .with_context(|| format!("Failed to parse Dockerfile {}", path.display()))?
    } else if let Some(path) = &source.descriptor {
        BuildDescriptor::load(path)?
    } else {
        let found = DESCRIPTOR_CANDIDATES
            .iter()
            .chain(std::iter::once(&"Dockerfile"))
            .map(|name| context.join(name))
            .find(|path| path.is_file());
        match found {
            Some(path) => {
                info!("Using descriptor {}", path.display());
                BuildDescriptor::load(&path)?
            }
            None => anyhow::bail!(
                "No descriptor found in {} (looked for {}, Dockerfile); use --descriptor or --dockerfile",
                context.display(),
                DESCRIPTOR_CANDIDATES.join(", ")
            ),
        }
    };

    descriptor
        .validate()
        .context("Build descriptor is invalid")?;
    Ok((context, descriptor))
}

fn load_config(cache_dir: Option<&PathBuf>) -> Result<SlipwayConfig> {
    let default_config = SlipwayConfig::default();
    let config = SlipwayConfig {
        cache_dir: cache_dir.cloned().unwrap_or(default_config.cache_dir.clone()),
        ..default_config
    };
    if cache_dir.is_some() {
        debug!("Cache directory overridden to: {}", config.cache_dir.display());
    }
    config.validate()?;
    Ok(config)
}

fn open_store(cache_dir: Option<&PathBuf>) -> Result<LayerStore> {
    let config = load_config(cache_dir)?;
    LayerStore::open(&config.cache_dir)
}

fn emit(output: &str, quiet: bool, destination: Option<&Path>) -> Result<()> {
    match destination {
        Some(path) => {
            fs::write(path, output)
                .with_context(|| format!("Failed to write output to {}", path.display()))?;
            info!("Output written to: {}", path.display());
            if !quiet {
                println!("Output written to: {}", path.display());
            }
        }
        None => print!("{}", output),
    }
    Ok(())
}

fn handle_plan(args: &PlanArgs) -> i32 {
    let result = load_source(&args.source).and_then(|(_, descriptor)| {
        let plan = BuildPlan::from_descriptor(&descriptor);
        OutputFormatter::new(args.format.into()).format_plan(&plan)
    });

    match result {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

fn handle_render(args: &RenderArgs, quiet: bool) -> i32 {
    let result = load_source(&args.source).and_then(|(_, descriptor)| {
        let rendered = dockerfile::render(&descriptor);
        emit(&rendered, quiet, args.output.as_deref())
    });

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

fn image_name(args: &BuildArgs, context: &Path, descriptor: &BuildDescriptor) -> String {
    args.tag
        .clone()
        .or_else(|| descriptor.metadata.project_name.clone())
        .or_else(|| {
            context
                .file_name()
                .map(|n| n.to_string_lossy().to_lowercase())
        })
        .unwrap_or_else(|| "image".to_string())
}

async fn handle_build(args: &BuildArgs, quiet: bool) -> i32 {
    info!("Starting build");

    let (context, descriptor) = match load_source(&args.source) {
        Ok(source) => source,
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
    };

    let config = match load_config(args.cache_dir.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            eprintln!("\nPlease check your SLIPWAY_* environment variables and command-line arguments.");
            return 1;
        }
    };
    debug!("{}", config);

    let store = match LayerStore::open(&config.cache_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("{:#}", e);
            return 1;
        }
    };
    let source = match image_source::from_config(&config) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to set up image source: {:#}", e);
            return 1;
        }
    };
    let installer = Arc::new(PipInstaller::from_config(&config));
    let progress: Arc<dyn ProgressHandler> = if quiet {
        Arc::new(NoOpHandler)
    } else {
        Arc::new(LoggingHandler)
    };

    let engine = BuildEngine::new(store, source, installer).with_progress(progress);

    let cancel = engine.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    let name = image_name(args, &context, &descriptor);
    let image = match engine.build(&descriptor, &context, &name).await {
        Ok(image) => image,
        Err(e) => {
            error!("Build failed: {}", e);
            return 1;
        }
    };

    if quiet {
        println!("{}", image.id);
        return 0;
    }

    match OutputFormatter::new(args.format.into()).format_image(&image) {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(e) => {
            error!("Failed to format output: {}", e);
            1
        }
    }
}

async fn handle_run(args: &RunArgs) -> i32 {
    let result = async {
        let store = open_store(args.cache_dir.as_ref())?;
        let image = store.load_image(&args.image)?;

        let overrides = RunOverrides {
            argv: (!args.command.is_empty()).then(|| args.command.clone()),
            env: args.env.iter().cloned().collect::<BTreeMap<_, _>>(),
            workdir: args.workdir.clone(),
        };
        let spec = LaunchSpec::resolve(&image.config, &image.base_env, &overrides)?;

        let root = materialise(&store, &image)?;
        let outcome = launch(&spec, root.path()).await?;
        Ok::<_, anyhow::Error>(outcome)
    }
    .await;

    match result {
        Ok(outcome) => {
            if !outcome.success() {
                debug!("Process ended with {:?}", outcome);
            }
            outcome.exit_code()
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

fn handle_inspect(args: &InspectArgs) -> i32 {
    let result = open_store(args.cache_dir.as_ref())
        .and_then(|store| store.load_image(&args.image))
        .and_then(|image| OutputFormatter::new(args.format.into()).format_image(&image));

    match result {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

fn handle_images(args: &ImagesArgs) -> i32 {
    let result = open_store(args.cache_dir.as_ref())
        .and_then(|store| store.list_images())
        .and_then(|images| OutputFormatter::new(args.format.into()).format_images(&images));

    match result {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

fn handle_prune(args: &PruneArgs) -> i32 {
    let result = open_store(args.cache_dir.as_ref())
        .and_then(|store| store.prune())
        .and_then(|report| OutputFormatter::new(args.format.into()).format_prune(&report));

    match result {
        Ok(output) => {
            print!("{}", output);
            0
        }
        Err(e) => {
            error!("{:#}", e);
            1
        }
    }
}

async fn check_image_source(config: &SlipwayConfig) -> HealthStatus {
    match config.image_source {
        ImageSourceKind::Docker => {
            let docker = match bollard::Docker::connect_with_local_defaults() {
                Ok(docker) => docker,
                Err(e) => {
                    warn!("Cannot connect to Docker: {}", e);
                    return HealthStatus::unavailable(format!("Cannot connect to Docker: {}", e))
                        .with_details(DOCKER_HINT.to_string());
                }
            };
            match docker.ping().await {
                Ok(_) => {
                    info!("Docker daemon is available");
                    HealthStatus::available("Docker daemon responded".to_string())
                        .with_details(format!("Pull missing images: {}", config.pull))
                }
                Err(e) => {
                    warn!("Docker daemon is not available: {}", e);
                    HealthStatus::unavailable(format!("Docker daemon did not respond: {}", e))
                        .with_details(DOCKER_HINT.to_string())
                }
            }
        }
        ImageSourceKind::Pinned => match image_source::from_config(config) {
            Ok(_) => HealthStatus::available("Pinned image table loaded".to_string()),
            Err(e) => {
                warn!("Pinned image table is unusable: {:#}", e);
                HealthStatus::unavailable(format!("{:#}", e))
            }
        },
    }
}

async fn check_package_index(index: &str) -> HealthStatus {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    match client.get(index).send().await {
        Ok(response) if response.status().is_success() => {
            info!("Package index is available at {}", index);
            HealthStatus::available(format!("Connected to {}", index))
        }
        Ok(response) => {
            warn!("Package index answered {}", response.status());
            HealthStatus::unavailable(format!("{} answered {}", index, response.status()))
        }
        Err(e) => {
            warn!("Package index is not available at {}: {}", index, e);
            HealthStatus::unavailable(format!("Cannot connect to {}", index))
                .with_details("Set SLIPWAY_PACKAGE_INDEX to a reachable index".to_string())
        }
    }
}

async fn handle_health(args: &HealthArgs) -> i32 {
    info!("Checking build dependencies");

    let config = SlipwayConfig::default();
    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return 1;
    }

    let mut health_results = BTreeMap::new();
    health_results.insert(
        format!("Image source ({})", config.image_source),
        check_image_source(&config).await,
    );
    health_results.insert(
        "Package index".to_string(),
        check_package_index(&config.package_index).await,
    );

    let format: OutputFormat = args.format.into();
    let output = match OutputFormatter::new(format)
        .format_health_with_config(&health_results, &config.to_display_map())
    {
        Ok(out) => out,
        Err(e) => {
            error!("Failed to format health output: {}", e);
            return 1;
        }
    };

    print!("{}", output);

    if health_results.values().all(|status| status.available) {
        0
    } else {
        1
    }
}

fn handle_schema() -> i32 {
    match serde_json::to_string_pretty(&BuildDescriptor::json_schema()) {
        Ok(schema) => {
            println!("{}", schema);
            0
        }
        Err(e) => {
            error!("Failed to serialize schema: {}", e);
            1
        }
    }
}
