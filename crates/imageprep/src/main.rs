use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use imageprep::config::{self, Arch, VarOverrides};
use imageprep::executor::StdoutSink;
use imageprep::host::SystemHost;
use imageprep::modules::dotnet::release::{self, GithubReleases, ReleaseSource};
use imageprep::pipeline::{self, RunOptions};
use imageprep::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Default, ClapArgs)]
struct VarArgs {
    /// Target architecture (defaults to the host)
    #[arg(long)]
    arch: Option<String>,
    /// PowerShell release tag, e.g. v7.4.6
    #[arg(long)]
    pwsh_version: Option<String>,
    /// .NET SDK version of the context tarball
    #[arg(long)]
    dotnet_version: Option<String>,
    /// Root of the `<arch>/<version>` context tree
    #[arg(long)]
    context_root: Option<PathBuf>,
    /// Image flavour used to pick the toolset file
    #[arg(long)]
    image_os: Option<String>,
}

impl VarArgs {
    fn overrides(&self, positional_version: Option<String>) -> VarOverrides {
        VarOverrides {
            arch: self.arch.clone(),
            pwsh_version: self.pwsh_version.clone().or(positional_version),
            dotnet_version: self.dotnet_version.clone(),
            context_root: self
                .context_root
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            image_os: self.image_os.clone(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load config and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Execute the full plan
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// PowerShell release tag (same as --pwsh-version)
        pwsh_version: Option<String>,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        vars: VarArgs,
    },
    /// Check the context directory for required inputs only
    Verify {
        build: PathBuf,
        #[command(flatten)]
        vars: VarArgs,
    },
    /// Run the staging step only
    Stage {
        build: PathBuf,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        vars: VarArgs,
    },
    /// Load config and print the fully-resolved TOML (after imports/extends)
    Resolve {
        build: PathBuf,
    },
    /// Resolve an IBM .NET SDK release against NuGet and print the tag
    DotnetResolve {
        /// Requested release tag, e.g. v9.0.100
        #[arg(long)]
        tag: Option<String>,
        /// List release tags matching a wildcard filter instead
        #[arg(long)]
        filter: Option<String>,
        /// Also print the SDK tarball URL for this architecture
        #[arg(long)]
        arch: Option<String>,
        #[arg(long, default_value = release::DEFAULT_REPO)]
        repo: String,
        #[arg(long, default_value = release::DEFAULT_NUGET_PACKAGE)]
        nuget_package: String,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    match dispatch(args.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_env("IMAGEPREP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn dispatch(cmd: Command) -> Result<()> {
    match cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Run {
            build,
            pwsh_version,
            dry_run,
            vars,
        } => cmd_run(&build, dry_run, vars.overrides(pwsh_version), None),
        Command::Verify { build, vars } => cmd_run(
            &build,
            false,
            vars.overrides(None),
            Some(vec!["preflight".into()]),
        ),
        Command::Stage {
            build,
            dry_run,
            vars,
        } => cmd_run(
            &build,
            dry_run,
            vars.overrides(None),
            Some(vec!["stage".into()]),
        ),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::DotnetResolve {
            tag,
            filter,
            arch,
            repo,
            nuget_package,
        } => cmd_dotnet_resolve(
            tag.as_deref(),
            filter.as_deref(),
            arch.as_deref(),
            &repo,
            &nuget_package,
        ),
    }
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = config::load(path)?;
    let plan = pipeline::build_plan(&doc, None)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<10} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path) -> Result<()> {
    let doc = config::load(path)?;
    let s = toml::to_string_pretty(&doc.value)
        .map_err(|e| Error::msg(format!("failed to render TOML: {e}")))?;
    print!("{s}");
    Ok(())
}

fn cmd_run(
    path: &Path,
    dry_run: bool,
    vars: VarOverrides,
    only: Option<Vec<String>>,
) -> Result<()> {
    let doc = config::load(path)?;
    let opts = RunOptions { dry_run, vars, only };
    let sink = Arc::new(StdoutSink::default());
    pipeline::run_build(&doc, &opts, Arc::new(SystemHost), sink)?;
    Ok(())
}

fn cmd_dotnet_resolve(
    tag: Option<&str>,
    filter: Option<&str>,
    arch: Option<&str>,
    repo: &str,
    nuget_package: &str,
) -> Result<()> {
    let src = GithubReleases::new(repo)?;
    let releases = src.releases()?;

    let Some(requested) = tag else {
        for t in release::filter_tags(&releases, filter)? {
            println!("{t}");
        }
        return Ok(());
    };

    let nuget = src.nuget_versions(nuget_package)?;
    let res = release::resolve_release(requested, &releases, &nuget)?;
    if !res.exact {
        eprintln!("WARN: {requested} is not available on NuGet, using {}", res.tag);
    }
    println!("{}", res.tag);

    if let Some(raw) = arch {
        let arch: Arch = raw.parse()?;
        let rel = src.release(&res.tag)?;
        let asset = release::select_sdk_asset(&rel, arch.as_str()).ok_or_else(|| {
            Error::msg(format!("release {} has no SDK tarball for {arch}", res.tag))
        })?;
        println!("{}", asset.browser_download_url);
    }
    Ok(())
}
