//-
// Copyright (c) 2015, 2016, Lavaboom Ltd
//
// This file is part of Lavamail.
//
// Lavamail is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU  General Public License  as published by  the Free
// Software Foundation, either version 3  of the License, or (at your option)
// any later version.
//
// Lavamail is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even  the implied warranty  of MERCHANTABILITY  or
// FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Lavamail. If not, see <http://www.gnu.org/licenses/>.

//! Process wiring: flags, logging, the store, the signer cache and its
//! invalidator, the outbound worker pool and the SMTP listeners.

use std::net::TcpListener;
use std::sync::Arc;

use log::{error, info};
use structopt::StructOpt;

use crate::queue;
use crate::smtp::inbound::delivery::{InboundHandler, StoreWriter};
use crate::smtp::inbound::server::{Server, ServerConfig};
use crate::smtp::outbound::dkim_service::DkimService;
use crate::smtp::outbound::relay::SmtpRelay;
use crate::smtp::outbound::worker::OutboundWorker;
use crate::spam::SpamdClient;
use crate::store::Store;
use crate::support::report::LogReporter;
use crate::support::sysexits::*;

/// Every option doubles as an environment variable (the uppercase name),
/// which is how production deployments configure the mailer.
#[derive(StructOpt, Debug)]
#[structopt(name = "lavamail", max_term_width = 80)]
struct Options {
    /// DSN of the Raven connection
    #[structopt(long = "raven_dsn", env = "RAVEN_DSN", default_value = "")]
    raven_dsn: String,

    /// Path of the mailer database
    #[structopt(
        long = "database_path",
        env = "DATABASE_PATH",
        default_value = "lavamail.db"
    )]
    database_path: String,

    /// Addresses used to bind the handler
    #[structopt(
        long = "handler_addresses",
        env = "HANDLER_ADDRESSES",
        default_value = ":25,:587"
    )]
    handler_addresses: String,

    /// Welcome message displayed upon connecting to the server
    #[structopt(
        long = "handler_welcome",
        env = "HANDLER_WELCOME",
        default_value = "Welcome to Lavaboom!"
    )]
    handler_welcome: String,

    /// Hostname of the mailer
    #[structopt(
        long = "handler_hostname",
        env = "HANDLER_HOSTNAME",
        default_value = "localhost"
    )]
    handler_hostname: String,

    /// Connection read timeout expressed in seconds (0 disables)
    #[structopt(
        long = "handler_read_timeout",
        env = "HANDLER_READ_TIMEOUT",
        default_value = "0"
    )]
    handler_read_timeout: u64,

    /// Connection write timeout expressed in seconds (0 disables)
    #[structopt(
        long = "handler_write_timeout",
        env = "HANDLER_WRITE_TIMEOUT",
        default_value = "0"
    )]
    handler_write_timeout: u64,

    /// Data stream timeout expressed in seconds (0 disables)
    #[structopt(
        long = "handler_data_timeout",
        env = "HANDLER_DATA_TIMEOUT",
        default_value = "0"
    )]
    handler_data_timeout: u64,

    /// Max connections that can be handled by the mailer (0 = unlimited)
    #[structopt(
        long = "handler_max_connections",
        env = "HANDLER_MAX_CONNECTIONS",
        default_value = "0"
    )]
    handler_max_connections: usize,

    /// Max message size accepted by the mailer in bytes (0 = unlimited)
    #[structopt(
        long = "handler_max_message_size",
        env = "HANDLER_MAX_MESSAGE_SIZE",
        default_value = "0"
    )]
    handler_max_message_size: usize,

    /// Max recipients count per envelope (0 = unlimited)
    #[structopt(
        long = "handler_max_recipients",
        env = "HANDLER_MAX_RECIPIENTS",
        default_value = "0"
    )]
    handler_max_recipients: usize,

    /// Enable STARTTLS?
    #[structopt(long = "handler_enable_tls")]
    handler_enable_tls: bool,

    /// Path of the TLS certificate to load
    #[structopt(long = "handler_tls_cert", env = "HANDLER_TLS_CERT", default_value = "")]
    handler_tls_cert: String,

    /// Path of the TLS key to load
    #[structopt(long = "handler_tls_key", env = "HANDLER_TLS_KEY", default_value = "")]
    handler_tls_key: String,

    /// Address of the spamd server to use
    #[structopt(
        long = "spamd_address",
        env = "SPAMD_ADDRESS",
        default_value = "127.0.0.1:783"
    )]
    spamd_address: String,

    /// Address of the SMTP relay to use
    #[structopt(
        long = "smtpd_address",
        env = "SMTPD_ADDRESS",
        default_value = "127.0.0.1:2525"
    )]
    smtpd_address: String,

    /// Size of the LRU cache with DKIM signers
    #[structopt(long = "dkim_lru_size", env = "DKIM_LRU_SIZE", default_value = "128")]
    dkim_lru_size: usize,

    /// Concurrency of the consumer that sends out emails
    #[structopt(
        long = "consumer_concurrency",
        env = "CONSUMER_CONCURRENCY",
        default_value = "10"
    )]
    consumer_concurrency: usize,
}

pub fn main() {
    let options = Options::from_args();
    crate::init_simple_log();

    if let Err(exit) = run(options) {
        exit.exit();
    }
}

fn run(options: Options) -> Result<(), Sysexit> {
    // The Sentry transport is wired by the deployment; in-process the
    // reporter boundary logs. The DSN is surfaced so misconfiguration is
    // visible.
    if !options.raven_dsn.is_empty() {
        info!("crash reporting DSN configured: {}", options.raven_dsn);
    }
    let reporter = Arc::new(LogReporter);

    let store = Store::open(&options.database_path).map_err(|e| {
        error!("failed to open store at {}: {}", options.database_path, e);
        EX_UNAVAILABLE
    })?;

    // Outbound: signer cache + invalidator, relay, worker pool.
    let dkim = DkimService::new(store.clone(), options.dkim_lru_size);
    let _invalidator = dkim.spawn_invalidator();

    let relay = Arc::new(SmtpRelay::new(&options.smtpd_address));
    let worker = Arc::new(OutboundWorker::new(
        store.clone(),
        dkim,
        relay,
        reporter.clone(),
    ));
    // The message-bus adapter publishes into this queue; everything from
    // here on is ours.
    let send_queue = queue::LocalQueue::new();
    let _workers = queue::consume(
        send_queue.clone(),
        worker,
        options.consumer_concurrency,
    );

    // Inbound: scorer, writer, handler, listeners.
    let scorer = Arc::new(SpamdClient::new(options.spamd_address.clone()));
    let writer = Arc::new(StoreWriter::new(store.clone()));
    let handler =
        Arc::new(InboundHandler::new(store.clone(), scorer, writer));

    let tls = if options.handler_enable_tls {
        Some(build_tls_acceptor(
            &options.handler_tls_cert,
            &options.handler_tls_key,
        )?)
    } else {
        None
    };

    let server = Server::new(
        ServerConfig {
            hostname: options.handler_hostname.clone(),
            welcome: options.handler_welcome.clone(),
            read_timeout_secs: options.handler_read_timeout,
            write_timeout_secs: options.handler_write_timeout,
            data_timeout_secs: options.handler_data_timeout,
            max_connections: options.handler_max_connections,
            max_message_size: options.handler_max_message_size,
            max_recipients: options.handler_max_recipients,
        },
        tls,
        handler,
        reporter,
    );

    let addresses = options
        .handler_addresses
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if addresses.is_empty() {
        error!("no bind addresses configured");
        return Err(EX_CONFIG);
    }

    for address in &addresses[..addresses.len() - 1] {
        let listener = bind(address)?;
        let server = Arc::clone(&server);
        std::thread::spawn(move || {
            if let Err(e) = server.serve(listener) {
                error!("listener failed: {}", e);
                EX_IOERR.exit();
            }
        });
    }

    let listener = bind(&addresses[addresses.len() - 1])?;
    server.serve(listener).map_err(|e| {
        error!("listener failed: {}", e);
        EX_IOERR
    })?;

    Ok(())
}

fn bind(address: &str) -> Result<TcpListener, Sysexit> {
    // ":25" means every interface
    let address = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_owned()
    };

    TcpListener::bind(&address).map_err(|e| {
        error!("cannot bind {}: {}", address, e);
        EX_UNAVAILABLE
    })
}

fn build_tls_acceptor(
    cert_path: &str,
    key_path: &str,
) -> Result<openssl::ssl::SslAcceptor, Sysexit> {
    if cert_path.is_empty() || key_path.is_empty() {
        error!("TLS enabled but certificate or key path is missing");
        return Err(EX_CONFIG);
    }

    let mut builder = openssl::ssl::SslAcceptor::mozilla_intermediate(
        openssl::ssl::SslMethod::tls(),
    )
    .map_err(|e| {
        error!("cannot initialise TLS: {}", e);
        EX_SOFTWARE
    })?;

    builder
        .set_private_key_file(key_path, openssl::ssl::SslFiletype::PEM)
        .and_then(|_| builder.set_certificate_chain_file(cert_path))
        .and_then(|_| builder.check_private_key())
        .map_err(|e| {
            error!("cannot load TLS key material: {}", e);
            EX_CONFIG
        })?;

    Ok(builder.build())
}
