//! The per-host collection pipeline: resolve the host's credential and
//! session kind, run its commands, route raw responses through the parser
//! registry, and stream tagged points to the sink, finishing with a
//! bookkeeping point whether or not the host was reachable.

use crate::session::{DeviceSession, SessionError, SessionOptions};
use crate::MEASUREMENT_PREFIX;
use catalog::HostManager;
use parsers::ParserRegistry;
use points::{now_ns, Output, Point};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// The seam between the scheduler and the collection pipeline; the
/// scheduler only ever needs this one entry point.
pub trait Collect: Send + Sync {
    fn collect(&self, worker_name: &str, request: CollectRequest);
}

/// What to collect: either a host list whose command sets are recomputed
/// through the host manager, or an explicit host-to-commands map.
#[derive(Debug, Clone)]
pub enum CollectRequest {
    Hosts {
        hosts: Vec<String>,
        cmd_tags: Vec<String>,
    },
    HostCommands(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, Clone, Default)]
pub struct CollectorOptions {
    pub session: SessionOptions,
}

pub struct Collector {
    hosts: Arc<HostManager>,
    parsers: Arc<ParserRegistry>,
    output: Arc<Output>,
    options: CollectorOptions,
}

impl Collector {
    pub fn new(
        hosts: Arc<HostManager>,
        parsers: Arc<ParserRegistry>,
        output: Arc<Output>,
        options: CollectorOptions,
    ) -> Collector {
        Collector {
            hosts,
            parsers,
            output,
            options,
        }
    }

    fn resolve_request(&self, request: CollectRequest) -> BTreeMap<String, Vec<String>> {
        match request {
            CollectRequest::HostCommands(map) => map,
            CollectRequest::Hosts { hosts, cmd_tags } => {
                let mut map = BTreeMap::new();
                for host in hosts {
                    let commands: Vec<String> = self
                        .hosts
                        .get_target_commands(&host, &cmd_tags)
                        .into_iter()
                        .flat_map(|group| group.commands)
                        .collect();
                    map.insert(host, commands);
                }
                map
            }
        }
    }

    /// One host: session, commands, parsing, stats, emission. Returns the
    /// full point stream so the caller controls where it goes.
    pub(crate) fn collect_host(
        &self,
        worker_name: &str,
        host: &str,
        commands: &[String],
    ) -> Vec<Point> {
        let credential = self.hosts.get_credentials(host);
        let address = self.hosts.get_address(host);
        let context = self.hosts.get_context(host);
        let device_type = self.hosts.get_device_type(host);

        tracing::info!(host, worker = worker_name, "collector starting");

        let mut session = match (credential, address) {
            (Some(credential), Some(address)) => Some(DeviceSession::new(
                device_type,
                host,
                &address,
                credential,
                &context,
                self.options.session.clone(),
            )),
            (credential, _) => {
                if credential.is_none() {
                    tracing::error!(host, "no credential matches this host");
                } else {
                    tracing::error!(host, "host has no address");
                }
                None
            }
        };

        let mut reachable = false;
        if let Some(session) = session.as_mut() {
            session.connect();
            if session.is_connected() {
                session.collect_facts();
                reachable = true;
            } else {
                tracing::error!(host, "unable to connect, skipping commands");
            }
        }

        let mut stream = Vec::new();
        let mut successful = 0u64;
        let mut errors = 0u64;
        let mut execution_secs = 0.0f64;

        if reachable {
            let session = session.as_mut().unwrap();
            let started = Instant::now();
            for command in commands {
                tracing::info!(host, command = %command, "collecting");
                match self.run_command(session, command) {
                    Ok(mut points) => {
                        stream.append(&mut points);
                        successful += 1;
                    }
                    Err(error) => {
                        errors += 1;
                        tracing::error!(host, command = %command, %error, "command failed");
                    }
                }
            }
            execution_secs = started.elapsed().as_secs_f64();
        }

        let mut stats = Point::new();
        stats.measurement = Some(format!("{}_host_collector_stats", MEASUREMENT_PREFIX));
        let device_name = session
            .as_ref()
            .map(|s| s.device_name().to_string())
            .unwrap_or_else(|| host.to_string());
        stats.insert_tag("device", &device_name);
        stats.insert_tag("worker_name", worker_name);
        for (key, value) in &context {
            stats.insert_tag(key.clone(), value);
        }
        for (key, value) in nomad_tags() {
            stats.insert_tag(key, &value);
        }
        stats.insert_field("execution_time_sec", format!("{:.4}", execution_secs));
        stats.insert_field("nbr_commands", (successful + errors) as i64);
        stats.insert_field("nbr_successful_commands", successful as i64);
        stats.insert_field("nbr_error_commands", errors as i64);
        stats.insert_field("reacheable", reachable as i64);
        stats.insert_field("unreacheable", !reachable as i64);
        stats.timestamp_ns = now_ns();
        stream.push(stats);

        if let Some(session) = session.as_mut() {
            if reachable {
                session.close();
            }
        }
        stream
    }

    /// Executes one command and turns the raw payload into finished points:
    /// parser lookup, measurement naming, fact/context tagging, timestamp.
    fn run_command(
        &self,
        session: &mut DeviceSession,
        command: &str,
    ) -> Result<Vec<Point>, CommandError> {
        let descriptor = self
            .parsers
            .find(command)
            .ok_or_else(|| CommandError::NoParser(command.to_string()))?;

        // NETCONF runs the parser's declared command; HTTP kinds run its
        // relative query URL.
        let target = if session.executes_queries() {
            descriptor
                .query
                .clone()
                .ok_or_else(|| CommandError::NoQuery(descriptor.name.clone()))?
        } else {
            match &descriptor.command {
                Some(declared) => declared.clone(),
                None => command.trim_end_matches(" | display xml").to_string(),
            }
        };

        let payload = session.execute(&target)?;
        let parsed = self.parsers.parse(command, &payload)?;
        let measurement = self.parsers.measurement_for(command);
        let timestamp_ns = now_ns();

        let mut out = Vec::with_capacity(parsed.len());
        for mut point in parsed {
            if !point.has_fields() {
                continue;
            }
            if point.measurement.is_none() {
                point.measurement = measurement.clone();
            }
            for (key, value) in session.facts() {
                point.insert_tag(key.clone(), value);
            }
            for (key, value) in session.context() {
                point.insert_tag(key.clone(), value);
            }
            point.timestamp_ns = timestamp_ns;
            out.push(point);
        }
        Ok(out)
    }
}

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("no parser found for command {0:?}")]
    NoParser(String),

    #[error("parser {0} declares no query for http execution")]
    NoQuery(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Parse(#[from] parsers::ParseError),
}

impl Collect for Collector {
    /// Collects every host of the request sequentially, emitting each
    /// host's stream before moving on so that per-host points stay
    /// contiguous at the sink.
    fn collect(&self, worker_name: &str, request: CollectRequest) {
        let host_cmds = self.resolve_request(request);
        if host_cmds.is_empty() {
            tracing::error!(worker = worker_name, "nothing to collect");
            return;
        }
        for (host, commands) in host_cmds {
            let stream = self.collect_host(worker_name, &host, &commands);
            if let Err(error) = self.output.emit(stream) {
                tracing::warn!(host = %host, %error, "failed to emit point stream");
            }
        }
    }
}

/// Scheduler placement tags, when the agent runs under Nomad.
pub(crate) fn nomad_tags() -> Vec<(String, String)> {
    let mut tags = Vec::new();
    for (env, tag) in [
        ("NOMAD_JOB_NAME", "nomad_job_name"),
        ("NOMAD_ALLOC_INDEX", "nomad_alloc_index"),
        ("NOMAD_ALLOC_ID", "nomad_alloc_id"),
    ] {
        if let Ok(value) = std::env::var(env) {
            tags.push((tag.to_string(), value));
        }
    }
    tags
}
