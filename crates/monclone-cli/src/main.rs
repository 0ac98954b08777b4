// Copyright 2026 MonClone Contributors
// Allow clippy warnings for CLI application
#![allow(clippy::unwrap_used, clippy::expect_used)]

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{clone, data, versions};

/// MonClone CLI - clone the operational configuration of a master
/// Monitor instance onto workers, with named snapshots in a pluggable
/// store.
///
/// Configuration merges from four layers, weakest first: the base config
/// file, the node-local overlay, `MC_`-prefixed environment variables,
/// and these flags.
#[derive(Parser)]
#[command(name = "monclone")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Monitor configuration cloning through versioned snapshots", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: GlobalOptions,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a cloning run (master: snapshot + upload, worker: apply)
    Clone,

    /// List the versions held in the store
    Showversions {
        /// Print only version ids and timestamps
        #[arg(long)]
        id_only: bool,
    },

    /// Dump one version's records (requires --version)
    Showdata {
        /// Restrict to these entity kinds
        #[arg(long = "kind")]
        kinds: Vec<String>,

        /// Restrict to these record names
        #[arg(long = "name")]
        names: Vec<String>,

        /// Print only data ids and names
        #[arg(long)]
        id_only: bool,
    },
}

#[derive(Args)]
struct GlobalOptions {
    /// Configuration file (suppresses the node-local overlay)
    #[arg(short = 'f', long)]
    config_file: Option<PathBuf>,

    /// Ignore every configuration file
    #[arg(long)]
    no_config_files: bool,

    /// Node name the endpoint must identify as
    #[arg(short, long)]
    node: Option<String>,

    /// Role of this node
    #[arg(short, long, value_parser = ["master", "worker", "replica"])]
    role: Option<String>,

    /// Monitor API endpoint
    #[arg(short, long)]
    endpoint: Option<String>,

    /// API user
    #[arg(short, long)]
    user: Option<String>,

    /// API password
    #[arg(short, long)]
    password: Option<String>,

    /// API token (preferred over user/password)
    #[arg(short, long)]
    token: Option<String>,

    /// Authenticate at the HTTP layer (basic auth) in front of the API
    #[arg(long)]
    http_auth: bool,

    /// Accept self-signed certificates
    #[arg(long)]
    self_cert: bool,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Never prompt for confirmation
    #[arg(short = 'y', long)]
    yes: bool,

    /// Change the admin password to --password after authentication
    #[arg(long)]
    update_password: bool,

    /// Wipe the worker before applying
    #[arg(long)]
    force_initialize: bool,

    /// Resolve DNS interfaces to IP addresses
    #[arg(long)]
    force_useip: bool,

    /// Overwrite same-named hosts whose identity tag differs
    #[arg(long)]
    host_update: bool,

    /// Update hosts that were renamed on this node
    #[arg(long)]
    force_host_update: bool,

    /// Keep local entities the snapshot no longer carries
    #[arg(long)]
    no_delete: bool,

    /// Skip template export/import
    #[arg(long)]
    template_skip: bool,

    /// Templates per export chunk
    #[arg(long)]
    template_separate: Option<usize>,

    /// First-run discovery rules and slow items after host import
    #[arg(long)]
    checknow_execute: bool,

    /// Item intervals targeted by the first run (comma-separated,
    /// e.g. 1h,30m)
    #[arg(long, value_delimiter = ',')]
    checknow_interval: Vec<String>,

    /// Seconds to wait before issuing the first run
    #[arg(long)]
    checknow_wait: Option<u64>,

    /// Parallel host operations
    #[arg(long)]
    worker_concurrency: Option<usize>,

    /// Version to apply (worker) or to show (showdata)
    #[arg(short = 'v', long)]
    version: Option<String>,

    /// Store driver: file, dydb, redis, direct, or a registered tag
    #[arg(short = 's', long)]
    store_type: Option<String>,

    /// Store endpoint: region (dydb), host (redis), master URL (direct),
    /// directory (file)
    #[arg(long)]
    store_endpoint: Option<String>,

    /// Store port (redis)
    #[arg(long)]
    store_port: Option<u16>,

    /// Store access id (dydb) or master node name (direct)
    #[arg(long)]
    store_access: Option<String>,

    /// Store credential: secret key, password, or master token
    #[arg(long)]
    store_credential: Option<String>,

    /// Items per write burst (dydb)
    #[arg(long)]
    store_limit: Option<u64>,

    /// Seconds between write bursts (dydb)
    #[arg(long)]
    store_interval: Option<u64>,
}

impl GlobalOptions {
    /// Command-line values as the strongest configuration layer. Flags
    /// that were not given must not mask file or environment values, so
    /// only present values land in the map.
    fn overrides(&self) -> Map<String, Value> {
        let mut map = Map::new();
        let mut set_str = |key: &str, value: &Option<String>| {
            if let Some(value) = value {
                map.insert(key.to_string(), json!(value));
            }
        };
        set_str("node", &self.node);
        set_str("role", &self.role);
        set_str("endpoint", &self.endpoint);
        set_str("user", &self.user);
        set_str("password", &self.password);
        set_str("token", &self.token);
        set_str("version", &self.version);
        set_str("store_type", &self.store_type);
        set_str("store_endpoint", &self.store_endpoint);
        set_str("store_access", &self.store_access);
        set_str("store_credential", &self.store_credential);

        for (key, flag) in [
            ("http_auth", self.http_auth),
            ("self_cert", self.self_cert),
            ("quiet", self.quiet),
            ("yes", self.yes),
            ("update_password", self.update_password),
            ("force_initialize", self.force_initialize),
            ("force_useip", self.force_useip),
            ("host_update", self.host_update),
            ("force_host_update", self.force_host_update),
            ("no_delete", self.no_delete),
            ("template_skip", self.template_skip),
            ("checknow_execute", self.checknow_execute),
        ] {
            if flag {
                map.insert(key.to_string(), json!(true));
            }
        }

        if let Some(value) = self.template_separate {
            map.insert("template_separate".into(), json!(value));
        }
        if let Some(value) = self.checknow_wait {
            map.insert("checknow_wait".into(), json!(value));
        }
        if let Some(value) = self.worker_concurrency {
            map.insert("worker_concurrency".into(), json!(value));
        }
        if let Some(value) = self.store_port {
            map.insert("store_port".into(), json!(value));
        }
        if let Some(value) = self.store_limit {
            map.insert("store_limit".into(), json!(value));
        }
        if let Some(value) = self.store_interval {
            map.insert("store_interval".into(), json!(value));
        }
        if !self.checknow_interval.is_empty() {
            map.insert("checknow_interval".into(), json!(self.checknow_interval));
        }
        map
    }
}

/// Exit codes: 0 success, 2 auth/version precondition, 3 store
/// precondition, 254 unhandled error, 255 section failure.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = match monclone::Settings::load(
        cli.options.overrides(),
        cli.options.config_file.as_deref(),
        cli.options.no_config_files,
    ) {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Clone => clone::run(settings).await,
        Commands::Showversions { id_only } => versions::run(settings, id_only).await,
        Commands::Showdata {
            kinds,
            names,
            id_only,
        } => data::run(settings, kinds, names, id_only).await,
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("{error}");
            let code = error
                .downcast_ref::<monclone::Error>()
                .map(monclone::Error::exit_code)
                .unwrap_or(254);
            std::process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides_for(args: &[&str]) -> Map<String, Value> {
        let mut argv = vec!["monclone"];
        argv.extend(args);
        argv.push("clone");
        Cli::parse_from(argv).options.overrides()
    }

    #[test]
    fn unset_flags_leave_the_map_empty() {
        // Nothing given on the command line must mask a file or
        // environment value.
        assert!(overrides_for(&[]).is_empty());
    }

    #[test]
    fn string_flags_land_under_their_config_keys() {
        let map = overrides_for(&[
            "--node",
            "edge-7",
            "--role",
            "worker",
            "--endpoint",
            "https://edge-7.example",
            "--token",
            "t0ken",
            "--store-type",
            "redis",
            "--store-endpoint",
            "cache.internal",
        ]);
        assert_eq!(map.get("node"), Some(&json!("edge-7")));
        assert_eq!(map.get("role"), Some(&json!("worker")));
        assert_eq!(map.get("endpoint"), Some(&json!("https://edge-7.example")));
        assert_eq!(map.get("token"), Some(&json!("t0ken")));
        assert_eq!(map.get("store_type"), Some(&json!("redis")));
        assert_eq!(map.get("store_endpoint"), Some(&json!("cache.internal")));
        assert!(map.get("password").is_none());
    }

    #[test]
    fn boolean_flags_only_appear_when_raised() {
        let map = overrides_for(&["--no-delete", "--force-useip", "--quiet", "-y"]);
        assert_eq!(map.get("no_delete"), Some(&json!(true)));
        assert_eq!(map.get("force_useip"), Some(&json!(true)));
        assert_eq!(map.get("quiet"), Some(&json!(true)));
        assert_eq!(map.get("yes"), Some(&json!(true)));
        // A flag left down must be absent, not false, so it cannot
        // override a YES from the config file.
        assert!(map.get("force_initialize").is_none());
        assert!(map.get("template_skip").is_none());
    }

    #[test]
    fn numeric_flags_carry_their_values() {
        let map = overrides_for(&[
            "--worker-concurrency",
            "8",
            "--template-separate",
            "50",
            "--checknow-wait",
            "10",
            "--store-port",
            "6380",
            "--store-limit",
            "5",
        ]);
        assert_eq!(map.get("worker_concurrency"), Some(&json!(8)));
        assert_eq!(map.get("template_separate"), Some(&json!(50)));
        assert_eq!(map.get("checknow_wait"), Some(&json!(10)));
        assert_eq!(map.get("store_port"), Some(&json!(6380)));
        assert_eq!(map.get("store_limit"), Some(&json!(5)));
    }

    #[test]
    fn checknow_intervals_collect_into_a_list() {
        let map = overrides_for(&["--checknow-interval", "1h,30m"]);
        assert_eq!(map.get("checknow_interval"), Some(&json!(["1h", "30m"])));
        assert!(overrides_for(&[]).get("checknow_interval").is_none());
    }

    #[test]
    fn subcommand_arguments_parse() {
        let cli = Cli::parse_from(["monclone", "showdata", "--kind", "host", "--name", "web1", "--id-only"]);
        match cli.command {
            Commands::Showdata {
                kinds,
                names,
                id_only,
            } => {
                assert_eq!(kinds, vec!["host"]);
                assert_eq!(names, vec!["web1"]);
                assert!(id_only);
            }
            _ => panic!("expected showdata"),
        }
    }
}
