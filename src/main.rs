use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ldap_client::ldap_protocol::{AddRequest, ModifyRequest, SearchRequest, SearchScope};
use ldap_client::observer::TracingObserver;
use ldap_client::{transport, ClientConfig, Conn};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "ldap-client")]
#[command(about = "LDAPv3 command-line client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Server URL (overrides config; e.g. ldap://localhost:389)
    #[arg(short = 'H', long, value_name = "URL")]
    url: Option<String>,

    /// Bind DN (overrides config)
    #[arg(short = 'D', long, value_name = "DN")]
    bind_dn: Option<String>,

    /// Bind password (overrides config)
    #[arg(short = 'w', long, value_name = "PASSWORD")]
    password: Option<String>,

    /// Enable debug logging and packet dumps
    #[arg(short, long)]
    debug: bool,

    /// Print connection metrics in Prometheus format on exit
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the authorization identity of the bound user
    Whoami,
    /// Delete an entry
    Delete { dn: String },
    /// Modify attributes of an entry
    Modify {
        dn: String,
        /// attr=value to add (repeatable)
        #[arg(long = "add", value_name = "ATTR=VALUE")]
        add: Vec<String>,
        /// attr or attr=value to delete (repeatable)
        #[arg(long = "delete", value_name = "ATTR[=VALUE]")]
        delete: Vec<String>,
        /// attr=value to replace (repeatable)
        #[arg(long = "replace", value_name = "ATTR=VALUE")]
        replace: Vec<String>,
    },
    /// Add an entry
    Add {
        dn: String,
        /// attr=value pairs; repeat an attribute for several values
        #[arg(required = true, value_name = "ATTR=VALUE")]
        attributes: Vec<String>,
    },
    /// Compare an attribute value
    Compare { dn: String, attr: String, value: String },
    /// Search the directory
    Search {
        base: String,
        #[arg(default_value = "(objectClass=*)")]
        filter: String,
        /// Attributes to return (all user attributes when empty)
        attributes: Vec<String>,
        /// base, one or sub
        #[arg(short, long, default_value = "sub")]
        scope: SearchScope,
        #[arg(short = 'z', long, default_value_t = 0)]
        size_limit: i32,
    },
}

fn split_assignment(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .filter(|(attr, _)| !attr.is_empty())
        .ok_or_else(|| anyhow::anyhow!("Expected ATTR=VALUE, got {:?}", pair))
}

/// Group repeated attr=value arguments by attribute, keeping first-seen order.
fn group_values(pairs: &[String]) -> Result<Vec<(String, Vec<String>)>> {
    let mut grouped: Vec<(String, Vec<String>)> = Vec::new();
    for pair in pairs {
        let (attr, value) = split_assignment(pair)?;
        match grouped.iter_mut().find(|(name, _)| name.eq_ignore_ascii_case(attr)) {
            Some((_, values)) => values.push(value.to_string()),
            None => grouped.push((attr.to_string(), vec![value.to_string()])),
        }
    }
    Ok(grouped)
}

async fn run(conn: &Conn, command: Command) -> Result<()> {
    match command {
        Command::Whoami => {
            let authz = conn.who_am_i().await?;
            println!("{}", if authz.is_empty() { "anonymous" } else { authz.as_str() });
        }
        Command::Delete { dn } => {
            conn.delete(&dn).await?;
            info!("Deleted {}", dn);
        }
        Command::Modify {
            dn,
            add,
            delete,
            replace,
        } => {
            let mut req = ModifyRequest::new(&dn);
            for (attr, values) in group_values(&add)? {
                req = req.add(attr, values);
            }
            for item in &delete {
                req = match item.split_once('=') {
                    Some((attr, value)) => req.delete(attr, [value]),
                    None => req.delete(item.as_str(), Vec::<String>::new()),
                };
            }
            for (attr, values) in group_values(&replace)? {
                req = req.replace(attr, values);
            }
            conn.modify(&req).await?;
            info!("Modified {}", dn);
        }
        Command::Add { dn, attributes } => {
            let mut req = AddRequest::new(&dn);
            for (attr, values) in group_values(&attributes)? {
                req = req.attribute(attr, values);
            }
            conn.add(&req).await?;
            info!("Added {}", dn);
        }
        Command::Compare { dn, attr, value } => {
            let matched = conn.compare(&dn, &attr, value.as_bytes()).await?;
            println!("{}", matched);
        }
        Command::Search {
            base,
            filter,
            attributes,
            scope,
            size_limit,
        } => {
            let mut req = SearchRequest::new(base, scope, filter).with_attributes(attributes);
            req.size_limit = size_limit;
            let result = conn.search(&req).await?;
            for entry in &result.entries {
                println!("dn: {}", entry.dn);
                for attr in &entry.attrs {
                    for value in &attr.attr_values {
                        println!("{}: {}", attr.attr_type, String::from_utf8_lossy(value));
                    }
                }
                println!();
            }
            for referral in &result.referrals {
                println!("ref: {}", referral);
            }
            info!("{} entries, {} referrals", result.entries.len(), result.referrals.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_client={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(url) = args.url {
        config.url = url;
    }
    if let Some(dn) = args.bind_dn {
        let password = args
            .password
            .or_else(|| config.bind.as_ref().map(|b| b.password.clone()))
            .unwrap_or_default();
        config.bind = Some(ldap_client::config::BindConfig { dn, password });
    }

    debug!("Connecting to {}", config.url);
    let stream = transport::dial(&config.url, &config.tls, config.connect_timeout()).await?;
    let conn = Conn::new(stream, config.conn_options());
    if args.debug {
        conn.set_observer(TracingObserver);
    }

    if let Some(bind) = &config.bind {
        conn.simple_bind(&bind.dn, &bind.password)
            .await
            .with_context(|| format!("Bind as {}", bind.dn))?;
        debug!("Bound as {}", bind.dn);
    }

    let outcome = run(&conn, args.command).await;
    if let Err(e) = conn.unbind().await {
        debug!("Unbind failed: {}", e);
    }
    if args.print_metrics {
        print!("{}", conn.metrics().render());
    }
    outcome
}
