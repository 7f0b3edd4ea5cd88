use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Layered container builds with a content-addressed layer cache
#[derive(Parser, Debug)]
#[command(
    name = "slipway",
    about = "Layered container builds with a content-addressed layer cache",
    version,
    author,
    long_about = "slipway turns a build descriptor into a chain of cached layers: \
                  base image, staged source, installed dependencies, environment, \
                  exposed ports and entrypoint. Unchanged steps are replayed from the \
                  local cache; the first changed step and everything after it is rebuilt."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - suppress non-error output"
    )]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Show the build steps a descriptor expands to",
        long_about = "Loads the descriptor and prints the ordered step list without \
                      building anything.\n\n\
                      Examples:\n  \
                      slipway plan\n  \
                      slipway plan ./service --format json"
    )]
    Plan(PlanArgs),

    #[command(
        about = "Render the descriptor as a Dockerfile",
        long_about = "Emits the equivalent Dockerfile, in pipeline order.\n\n\
                      Examples:\n  \
                      slipway render\n  \
                      slipway render --descriptor slipway.yaml -o Dockerfile"
    )]
    Render(RenderArgs),

    #[command(
        about = "Build an image from a context directory",
        long_about = "Builds the layer chain into the local cache and records the image \
                      under its tag.\n\n\
                      Examples:\n  \
                      slipway build -t demo\n  \
                      slipway build ./service --dockerfile ./service/Dockerfile -t api"
    )]
    Build(BuildArgs),

    #[command(
        about = "Launch a built image's entrypoint",
        long_about = "Materialises the image and runs its entrypoint with the image \
                      environment. Anything after -- replaces the entrypoint. The exit \
                      code of the process is passed through.\n\n\
                      Examples:\n  \
                      slipway run demo\n  \
                      slipway run demo -e FLASK_DEBUG=1 -- python -m pytest"
    )]
    Run(RunArgs),

    #[command(about = "Show an image record and its layers")]
    Inspect(InspectArgs),

    #[command(about = "List images in the local cache")]
    Images(ImagesArgs),

    #[command(about = "Remove layers no image refers to")]
    Prune(PruneArgs),

    #[command(
        about = "Check build-time dependencies",
        long_about = "Checks that the base image source and the package index are \
                      reachable and prints the effective configuration.\n\n\
                      Examples:\n  \
                      slipway health\n  \
                      slipway health --format json"
    )]
    Health(HealthArgs),

    #[command(about = "Print the JSON schema of the build descriptor")]
    Schema,
}

/// Where the build context and descriptor come from
#[derive(Args, Debug, Clone, Default)]
pub struct SourceArgs {
    #[arg(
        value_name = "CONTEXT",
        help = "Build context directory (defaults to current directory)"
    )]
    pub context: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        conflicts_with = "dockerfile",
        help = "Descriptor file (YAML or TOML); defaults to slipway.yaml in the context"
    )]
    pub descriptor: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Read the descriptor from a Dockerfile")]
    pub dockerfile: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        help = "Write output to file instead of stdout"
    )]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    #[arg(
        short = 't',
        long,
        value_name = "NAME",
        help = "Image name (defaults to the project name or the context directory name)"
    )]
    pub tag: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Layer cache directory (defaults to SLIPWAY_CACHE_DIR)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(value_name = "IMAGE", help = "Image name as given to build --tag")]
    pub image: String,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VALUE",
        value_parser = parse_env_pair,
        help = "Set or override an environment variable (repeatable)"
    )]
    pub env: Vec<(String, String)>,

    #[arg(
        short = 'w',
        long,
        value_name = "DIR",
        help = "Working directory inside the image"
    )]
    pub workdir: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Layer cache directory (defaults to SLIPWAY_CACHE_DIR)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        last = true,
        value_name = "COMMAND",
        help = "Command replacing the entrypoint"
    )]
    pub command: Vec<String>,
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    #[arg(value_name = "IMAGE")]
    pub image: String,

    #[arg(
        long,
        value_name = "DIR",
        help = "Layer cache directory (defaults to SLIPWAY_CACHE_DIR)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct ImagesArgs {
    #[arg(
        long,
        value_name = "DIR",
        help = "Layer cache directory (defaults to SLIPWAY_CACHE_DIR)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct PruneArgs {
    #[arg(
        long,
        value_name = "DIR",
        help = "Layer cache directory (defaults to SLIPWAY_CACHE_DIR)"
    )]
    pub cache_dir: Option<PathBuf>,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Args, Debug, Clone)]
pub struct HealthArgs {
    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Yaml,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Yaml => super::output::OutputFormat::Yaml,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid environment entry '{}': expected KEY=VALUE", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use yare::parameterized;

    #[parameterized(
        simple = { "A=1", "A", "1" },
        empty_value = { "EMPTY=", "EMPTY", "" },
        equals_in_value = { "DSN=postgres://u:p@db/x?sslmode=require", "DSN", "postgres://u:p@db/x?sslmode=require" },
    )]
    fn test_parse_env_pair(input: &str, key: &str, value: &str) {
        assert_eq!(
            parse_env_pair(input),
            Ok((key.to_string(), value.to_string()))
        );
    }

    #[test]
    fn test_cli_args_verify() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn test_default_build_args() {
        let args = CliArgs::parse_from(["slipway", "build"]);
        match args.command {
            Commands::Build(build_args) => {
                assert!(build_args.source.context.is_none());
                assert!(build_args.source.descriptor.is_none());
                assert!(build_args.source.dockerfile.is_none());
                assert!(build_args.tag.is_none());
                assert_eq!(build_args.format, OutputFormatArg::Human);
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_build_with_options() {
        let args = CliArgs::parse_from([
            "slipway",
            "build",
            "/tmp/service",
            "--dockerfile",
            "/tmp/service/Dockerfile",
            "-t",
            "api",
            "--cache-dir",
            "/tmp/cache",
            "--format",
            "json",
        ]);
        match args.command {
            Commands::Build(build_args) => {
                assert_eq!(
                    build_args.source.context,
                    Some(PathBuf::from("/tmp/service"))
                );
                assert_eq!(
                    build_args.source.dockerfile,
                    Some(PathBuf::from("/tmp/service/Dockerfile"))
                );
                assert_eq!(build_args.tag.as_deref(), Some("api"));
                assert_eq!(build_args.cache_dir, Some(PathBuf::from("/tmp/cache")));
                assert_eq!(build_args.format, OutputFormatArg::Json);
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_descriptor_and_dockerfile_conflict() {
        let result = CliArgs::try_parse_from([
            "slipway",
            "plan",
            "--descriptor",
            "slipway.yaml",
            "--dockerfile",
            "Dockerfile",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_with_override() {
        let args = CliArgs::parse_from([
            "slipway",
            "run",
            "demo",
            "-e",
            "FLASK_DEBUG=1",
            "--env",
            "EMPTY=",
            "--",
            "python",
            "-m",
            "pytest",
        ]);
        match args.command {
            Commands::Run(run_args) => {
                assert_eq!(run_args.image, "demo");
                assert_eq!(
                    run_args.env,
                    vec![
                        ("FLASK_DEBUG".to_string(), "1".to_string()),
                        ("EMPTY".to_string(), String::new())
                    ]
                );
                assert_eq!(run_args.command, vec!["python", "-m", "pytest"]);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_rejects_malformed_env() {
        assert!(CliArgs::try_parse_from(["slipway", "run", "demo", "-e", "NOVALUE"]).is_err());
        assert!(CliArgs::try_parse_from(["slipway", "run", "demo", "-e", "=x"]).is_err());
    }

    #[test]
    fn test_health_command() {
        let args = CliArgs::parse_from(["slipway", "health"]);
        match args.command {
            Commands::Health(health_args) => {
                assert_eq!(health_args.format, OutputFormatArg::Human);
            }
            _ => panic!("Expected Health command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let args = CliArgs::parse_from(["slipway", "-v", "images"]);
        assert!(args.verbose);
        assert!(!args.quiet);

        let args = CliArgs::parse_from(["slipway", "-q", "schema"]);
        assert!(args.quiet);

        let args = CliArgs::parse_from(["slipway", "--log-level", "debug", "plan"]);
        assert_eq!(args.log_level, Some("debug".to_string()));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["slipway", "-v", "-q", "plan"]).is_err());
    }
}
