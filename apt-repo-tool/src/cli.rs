// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apt_repo_sync::{
        config::{PublishConfig, RemoteConfig, SigningConfig},
        error::RepoSyncError,
        planner::SyncState,
        publish::{writer::FilesystemRepositoryWriter, Publisher},
        remote::reader_from_str,
        signing::PgpReleaseSigner,
        storage::{
            filesystem::{FilesystemArtifactStore, FilesystemRepositoryStore},
            RepositoryStore,
        },
        sync::{SyncEvent, Syncer},
    },
    clap::{Arg, ArgMatches, Command},
    log::LevelFilter,
    serde::Deserialize,
    std::{
        path::PathBuf,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
};

const CONFIG_ABOUT: &str = "\
# YAML Configuration

Commands read a YAML file describing where state is kept, which remotes to
sync and how to publish the result. It has the following keys:

artifacts_dir (required) (string)
   Directory holding package files and retained metadata, keyed by content
   digest.

versions_dir (required) (string)
   Directory holding repository versions as JSON files.

remotes (optional) (list[object])
   Remotes to sync. Each entry has the following keys:

   repository (required) (string)
      Name of the local repository receiving content.

   url (required) (string)
      URL of the remote. `file://`, `http://` and `https://` are supported.

   distribution (required) (string)
      Distribution to sync. Values containing a `/` are treated as a path
      relative to the repository root. Otherwise `dists/<value>` is used.

   components (optional) (list[string])
      Components to sync, in priority order. Defaults to all advertised
      components.

   architectures (optional) (list[string])
      Architectures to sync. Defaults to all advertised architectures.

   mirror (optional) (bool)
      Make the local repository an exact copy of the remote. Content no longer
      advertised is removed and the remote's metadata is retained so it can be
      published verbatim.

   sync_sources (optional) (bool)
      Whether to sync source packages.

   max_concurrent_downloads (optional) (int)
      Maximum number of downloads in flight. Defaults to 8.

publications (optional) (list[object])
   Publications to produce. Each entry has the following keys:

   repository (required) (string)
      Name of the repository to publish.

   version (optional) (int)
      Version number to publish. Defaults to the latest version.

   destination (required) (string)
      Directory to write the repository to.

   options (required) (object)
      How to publish. Keys are `mode` (`simple`, `structured` or `verbatim`),
      `distribution`, `components`, `architectures`, `suite`, `codename`,
      `origin`, `label`, `version`, `description`, `compressions`,
      `checksums`, `acquire_by_hash` and `signing`.

      `signing` has the keys `key_path` (path to an armored PGP secret key),
      `passphrase_env` (environment variable holding the key passphrase) and
      `mode` (`detached`, `inline` or `both`).
";

#[derive(Debug, Error)]
pub enum ArtError {
    #[error("argument parsing error: {0}")]
    Clap(#[from] clap::Error),

    #[error("{0}")]
    RepoSync(#[from] RepoSyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("invalid sub-command: {0}")]
    InvalidSubCommand(String),

    #[error("repository {0} is not configured")]
    UnknownRepository(String),

    #[error("repository {0} has no versions")]
    NoVersions(String),

    #[error("environment variable {0} holding the signing key passphrase is not set")]
    MissingPassphrase(String),
}

pub type Result<T> = std::result::Result<T, ArtError>;

/// A publication to produce.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PublicationConfig {
    repository: String,
    version: Option<u64>,
    destination: PathBuf,
    options: PublishConfig,
}

/// The YAML configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolConfig {
    artifacts_dir: PathBuf,
    versions_dir: PathBuf,
    #[serde(default)]
    remotes: Vec<RemoteConfig>,
    #[serde(default)]
    publications: Vec<PublicationConfig>,
}

impl ToolConfig {
    fn from_args(args: &ArgMatches) -> Result<Self> {
        let path = args
            .value_of_os("config")
            .expect("config argument is required");

        let f = std::fs::File::open(path)?;

        Ok(serde_yaml::from_reader(f)?)
    }

    fn artifact_store(&self) -> FilesystemArtifactStore {
        FilesystemArtifactStore::new(&self.artifacts_dir)
    }

    fn repository_store(&self) -> FilesystemRepositoryStore {
        FilesystemRepositoryStore::new(&self.versions_dir)
    }
}

fn load_signer(config: &SigningConfig) -> Result<PgpReleaseSigner> {
    let passphrase = match &config.passphrase_env {
        Some(name) => {
            std::env::var(name).map_err(|_| ArtError::MissingPassphrase(name.clone()))?
        }
        None => String::new(),
    };

    let armored = std::fs::read_to_string(&config.key_path)?;

    Ok(PgpReleaseSigner::from_armored(&armored, passphrase)?)
}

fn config_arg<'a>() -> Arg<'a> {
    Arg::new("config")
        .long("config")
        .takes_value(true)
        .required(true)
        .allow_invalid_utf8(true)
        .help("Path to a YAML file defining the configuration")
}

fn repository_arg<'a>() -> Arg<'a> {
    Arg::new("repository")
        .long("repository")
        .takes_value(true)
        .help("Only operate on the named repository")
}

pub async fn run_cli() -> Result<()> {
    let default_threads = format!("{}", num_cpus::get());

    let app = Command::new("APT Repository Tool")
        .version("0.1")
        .author("Gregory Szorc <gregory.szorc@gmail.com>")
        .about("Sync and publish Debian repositories")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        )
        .arg(
            Arg::new("max-parallel-io")
                .long("max-parallel-io")
                .takes_value(true)
                .default_value(&default_threads)
                .global(true)
                .help("Maximum number of parallel writes when publishing"),
        );

    let app = app.subcommand(
        Command::new("sync")
            .about("Sync configured remotes into local repositories")
            .long_about(CONFIG_ABOUT)
            .arg(config_arg())
            .arg(repository_arg()),
    );

    let app = app.subcommand(
        Command::new("publish")
            .about("Publish repository versions to directories")
            .long_about(CONFIG_ABOUT)
            .arg(config_arg())
            .arg(repository_arg()),
    );

    let mut app = app.subcommand(
        Command::new("versions")
            .about("Print the versions of a repository")
            .arg(config_arg())
            .arg(
                Arg::new("repository")
                    .required(true)
                    .help("Name of the repository"),
            ),
    );

    let matches = app.clone().get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_target(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("sync", args)) => command_sync(args).await,
        Some(("publish", args)) => command_publish(args).await,
        Some(("versions", args)) => command_versions(args).await,
        Some((command, _)) => Err(ArtError::InvalidSubCommand(command.to_string())),
        None => {
            app.print_help()?;
            Ok(())
        }
    }
}

async fn command_sync(args: &ArgMatches) -> Result<()> {
    let config = ToolConfig::from_args(args)?;
    let only = args.value_of("repository");

    if let Some(name) = only {
        if !config.remotes.iter().any(|r| r.repository == name) {
            return Err(ArtError::UnknownRepository(name.to_string()));
        }
    }

    let artifacts = config.artifact_store();
    let repositories = config.repository_store();

    for remote in config
        .remotes
        .iter()
        .filter(|r| only.map(|name| r.repository == name).unwrap_or(true))
    {
        println!("syncing {} from {}", remote.repository, remote.url);

        let reader = reader_from_str(&remote.url)?;

        let pb = Arc::new(Mutex::new(None));

        let cb = move |event: SyncEvent| match event {
            SyncEvent::Planned { additions, .. } if additions > 0 => {
                pb.lock()
                    .unwrap()
                    .replace(pbr::ProgressBar::new(additions as u64));
            }
            SyncEvent::ArtifactDownloaded(_) | SyncEvent::ArtifactReused(_) => {
                if let Some(bar) = pb.lock().unwrap().as_mut() {
                    bar.inc();
                }
            }
            SyncEvent::StateChanged(SyncState::Finalizing | SyncState::Failed) => {
                if let Some(mut bar) = pb.lock().unwrap().take() {
                    bar.finish();
                }
            }
            SyncEvent::VersionCreated(_, _) => {
                println!("{}", event);
            }
            _ => {}
        };

        let version = Syncer::new(&*reader, &artifacts, &repositories)
            .with_progress_callback(cb)
            .sync(remote)
            .await?;

        println!(
            "{} is at version {} with {} packages",
            version.repository,
            version.number,
            version.units.len()
        );
    }

    Ok(())
}

async fn command_publish(args: &ArgMatches) -> Result<()> {
    let max_parallel_io = args.value_of_t::<usize>("max-parallel-io")?;
    let config = ToolConfig::from_args(args)?;
    let only = args.value_of("repository");

    if let Some(name) = only {
        if !config.publications.iter().any(|p| p.repository == name) {
            return Err(ArtError::UnknownRepository(name.to_string()));
        }
    }

    let artifacts = config.artifact_store();
    let repositories = config.repository_store();

    for publication in config
        .publications
        .iter()
        .filter(|p| only.map(|name| p.repository == name).unwrap_or(true))
    {
        let version = match publication.version {
            Some(number) => {
                repositories
                    .version(&publication.repository, number)
                    .await?
            }
            None => repositories
                .latest_version(&publication.repository)
                .await?
                .ok_or_else(|| ArtError::NoVersions(publication.repository.clone()))?,
        };

        let signer = publication
            .options
            .signing
            .as_ref()
            .map(load_signer)
            .transpose()?;

        let mut publisher = Publisher::new(&artifacts);
        if let Some(signer) = &signer {
            publisher = publisher.with_signer(signer);
        }

        println!(
            "publishing version {} of {} to {}",
            version.number,
            version.repository,
            publication.destination.display()
        );

        let result = publisher
            .publish(&version, &publication.options.to_options())
            .await?;

        let writer = FilesystemRepositoryWriter::new(&publication.destination);
        let summary = result
            .write_to(&writer, &artifacts, max_parallel_io, &None)
            .await?;

        println!(
            "wrote {} files ({} already current)",
            summary.written, summary.skipped
        );
    }

    Ok(())
}

async fn command_versions(args: &ArgMatches) -> Result<()> {
    let config = ToolConfig::from_args(args)?;
    let name = args
        .value_of("repository")
        .expect("repository argument is required");

    let repositories = config.repository_store();

    let latest = repositories
        .latest_version(name)
        .await?
        .ok_or_else(|| ArtError::NoVersions(name.to_string()))?;

    for number in 1..=latest.number {
        let version = repositories.version(name, number).await?;

        println!(
            "{}\t{}\t{} packages{}",
            version.number,
            version.created.to_rfc3339(),
            version.units.len(),
            if version.origin.mirror { "\tmirror" } else { "" }
        );
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_config() -> Result<()> {
        let config: ToolConfig = serde_yaml::from_str(
            "artifacts_dir: state/artifacts\n\
             versions_dir: state/versions\n\
             remotes:\n\
             - repository: debian\n\
             \x20 url: https://deb.debian.org/debian\n\
             \x20 distribution: bookworm\n\
             \x20 components: [main]\n\
             \x20 mirror: true\n\
             publications:\n\
             - repository: debian\n\
             \x20 destination: public\n\
             \x20 options:\n\
             \x20   mode: verbatim\n\
             \x20   distribution: bookworm\n",
        )?;

        assert_eq!(config.remotes.len(), 1);
        assert!(config.remotes[0].mirror);
        assert_eq!(config.remotes[0].max_concurrent_downloads, 8);
        assert_eq!(config.publications[0].version, None);
        assert_eq!(config.publications[0].destination, PathBuf::from("public"));

        assert!(serde_yaml::from_str::<ToolConfig>("artifacts_dir: a\nversions_dir: b\nextra: 1\n").is_err());

        Ok(())
    }
}
