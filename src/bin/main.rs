use std::{
    fs::OpenOptions,
    io::{self, IsTerminal, Write},
    path::Path,
    process::ExitCode,
};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cradle::{
    cancel::CancelToken,
    checkenv::check_env,
    cli::{Cli, Commands, InitFormat, parse_args},
    config::{SAMPLE_JSON, SAMPLE_YAML, load_config, load_dot_env},
    depends::wait_for_dependencies,
    error::{ConfigError, CradleError},
    report::{self, Report},
    signals::SignalSubscription,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    let result = match args.command {
        Commands::Run {
            config,
            dryrun,
            dotenv,
            command,
            args,
        } => run(&config, dryrun, &dotenv, command, args),
        Commands::Init { format } => init(format),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// Prints colour-aware text to stdout.
struct Console {
    out: io::Stdout,
    color: bool,
}

impl Console {
    fn new() -> Self {
        let out = io::stdout();
        let color = out.is_terminal();
        Self { out, color }
    }

    fn print(&mut self, text: &str) {
        let _ = write!(self.out, "{}", report::paint(text, self.color));
        let _ = self.out.flush();
    }

    fn section(&mut self, title: &str, report: &Report, error_only: bool) {
        self.print(&format!("\n{}\n", report::banner(title)));
        let mut out = self.out.lock();
        if let Ok(true) = report.dump(&mut out, error_only, self.color) {
            drop(out);
            self.print(&format!("\n{}", report::no_error()));
        }
    }
}

fn run(
    candidates: &str,
    dry_run: bool,
    dotenv: &str,
    command: String,
    args: Vec<String>,
) -> Result<ExitCode, CradleError> {
    let working_dir = std::env::current_dir().map_err(|source| ConfigError::Read {
        path: ".".into(),
        source,
    })?;
    let mut console = Console::new();

    console.print(&report::banner("Config File"));
    let (path, config) = load_config(candidates, &working_dir)?;
    match &path {
        Some(path) => console.print(&format!(
            "\x1b[33m{}\x1b[0m\n    <= \x1b[35m{candidates}\x1b[0m\n",
            path.display()
        )),
        None => console.print(&format!(
            "\x1b[33mwarning:\x1b[0m Can't find any config files. Use default value.\n    <= \x1b[35m{candidates}\x1b[0m\n"
        )),
    }

    let dot_envs = load_dot_env(&working_dir.join(dotenv))?;
    let os_envs = std::env::vars_os().map(|(key, value)| {
        format!("{}={}", key.to_string_lossy(), value.to_string_lossy())
    });
    let (env_results, store) = check_env(&config, os_envs, dot_envs, true);
    let env_report = report::env_report(&env_results);

    let targets = config.dependency_targets()?;
    let outcomes = if targets.is_empty() {
        Vec::new()
    } else {
        info!("Waiting for {} dependencies", targets.len());
        wait_for_dependencies(&targets, &CancelToken::new())
    };
    let dependency_report = report::dependency_report(&outcomes);

    let error_only = env_report.has_error() || dependency_report.has_error();
    console.section("Environment Variables", &env_report, error_only);
    if !targets.is_empty() {
        console.section("Dependencies", &dependency_report, error_only);
    }
    if error_only {
        console.print("\n\x1b[1;31mFail to run command due to configuration error.\x1b[0m\n");
        return Err(CradleError::Preflight);
    }

    console.print(&format!("\n{}", report::banner("Execute Command")));
    console.print(&report::command_line(&command, &args, dry_run));
    if dry_run {
        return Ok(ExitCode::SUCCESS);
    }

    let signals = SignalSubscription::os()?;
    console.print(&format!("\n{}", report::banner("Start Execution")));
    let run = Supervisor::new(command, args, signals)
        .env(store)
        .config(config)
        .working_dir(working_dir)
        .run()?;

    console.print(&format!("\n{}", report::banner("Process Result")));
    console.print(&report::process_result(&run));
    Ok(ExitCode::from(
        u8::try_from(run.exit_code()).unwrap_or(u8::MAX),
    ))
}

fn init(format: InitFormat) -> Result<ExitCode, CradleError> {
    let path = Path::new(format.file_name());
    let content = match format {
        InitFormat::Yaml => SAMPLE_YAML,
        InitFormat::Json => SAMPLE_JSON,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| match source.kind() {
            io::ErrorKind::AlreadyExists => ConfigError::AlreadyExists(path.to_path_buf()),
            _ => ConfigError::Write {
                path: path.to_path_buf(),
                source,
            },
        })?;
    file.write_all(content.as_bytes())
        .map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    let mut console = Console::new();
    console.print(&format!(
        "\x1b[1;32mConfig file \"{}\" is generated successfully.\x1b[0m\n\nRun with the following command:\n\n\x1b[90m$\x1b[0m cradle run your-command options...\n",
        path.display()
    ));
    Ok(ExitCode::SUCCESS)
}
