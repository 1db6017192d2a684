//! The server loop: engine ticks, link events, RPC, scripts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vigil_core::{Command, Engine, EngineOutput, InstanceId, LinkKind, ScriptCall};
use vigil_scripts::{notification_argv, reconfig_argv, ScriptRunner};
use vigil_types::{Address, Event, EventLevel, RunId};
use vigil_wire::{cmd, Frame};

use crate::clock::Clock;
use crate::links::{
    spawn_command_link, spawn_pubsub_link, LinkEvent, LinkHandle, LinkRequest, ReplyKind,
};
use crate::rpc::{encode_fields, RpcCommand, RpcRequest};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to start a server.
#[derive(Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub announce: Address,
    pub primaries: Vec<vigil_types::PrimaryConfig>,
    pub rng_seed: u64,
}

/// The daemon: owns the engine, the script runner, and every link task.
pub struct Server {
    engine: Engine,
    scripts: ScriptRunner,
    clock: Clock,
    links: HashMap<(InstanceId, LinkKind), LinkHandle>,
    link_events_tx: mpsc::UnboundedSender<LinkEvent>,
    /// Taken by [`Server::run`]; the receiver must live outside `self` so
    /// the select loop can poll it while handlers borrow the server.
    link_events_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
}

impl Server {
    pub fn new(config: &ServerConfig, run_id: RunId) -> Result<Self> {
        let clock = Clock::new();
        let now = clock.now_ms();
        let mut engine = Engine::new(run_id, config.announce, config.rng_seed);

        for primary in &config.primaries {
            let out = engine
                .monitor(primary, now)
                .with_context(|| format!("monitor {}", primary.name))?;
            log_events(&out.events);
        }

        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            engine,
            scripts: ScriptRunner::new(),
            clock,
            links: HashMap::new(),
            link_events_tx,
            link_events_rx: Some(link_events_rx),
        })
    }

    /// Runs until ctrl-c.
    pub async fn run(mut self, listen: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding rpc listener on {listen}"))?;
        info!(%listen, runid = %self.engine.run_id(), "vigil supervisor running");

        let (rpc_tx, mut rpc_rx) = mpsc::unbounded_channel();
        tokio::spawn(crate::rpc::serve(listener, rpc_tx));

        let mut link_events_rx = self.link_events_rx.take().expect("run called once");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = self.clock.now_ms();
                    let out = self.engine.tick(now);
                    self.apply(out, now);
                    for event in self.scripts.tick(now) {
                        log_event(&event);
                    }
                }
                Some(event) = link_events_rx.recv() => {
                    self.on_link_event(event);
                }
                Some(request) = rpc_rx.recv() => {
                    self.on_rpc(request);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        for handle in self.links.values() {
            handle.abort();
        }
        Ok(())
    }

    // ========================================================================
    // Engine output execution
    // ========================================================================

    fn apply(&mut self, out: EngineOutput, now: u64) {
        log_events(&out.events);

        for call in out.scripts {
            let argv = match call {
                ScriptCall::Notification {
                    script,
                    event_kind,
                    message,
                } => notification_argv(&script, &event_kind, &message),
                ScriptCall::ClientReconfig {
                    script,
                    primary_name,
                    role,
                    stage,
                    from,
                    to,
                } => reconfig_argv(&script, &primary_name, role, stage, from, to),
            };
            self.scripts.schedule(argv, now);
        }

        for command in out.commands {
            self.execute(command);
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Connect {
                id,
                kind,
                addr,
                auth,
                generation,
            } => {
                let handle = match kind {
                    LinkKind::Command => spawn_command_link(
                        id.clone(),
                        addr.into(),
                        auth,
                        generation,
                        self.link_events_tx.clone(),
                    ),
                    LinkKind::Pubsub => spawn_pubsub_link(
                        id.clone(),
                        addr.into(),
                        auth,
                        generation,
                        self.link_events_tx.clone(),
                    ),
                };
                if let Some(old) = self.links.insert((id, kind), handle) {
                    old.abort();
                }
            }
            Command::KillLink { id, kind, generation } => {
                if let Some(handle) = self.links.get(&(id.clone(), kind)) {
                    if handle.generation == generation {
                        if let Some(handle) = self.links.remove(&(id, kind)) {
                            handle.abort();
                        }
                    }
                }
            }
            Command::Ping { id } => self.send(&id, cmd::ping(), ReplyKind::Ping),
            Command::Info { id } => self.send(&id, cmd::info(), ReplyKind::Info),
            Command::PublishHello { id, payload } => {
                self.send(&id, cmd::publish_hello(&payload), ReplyKind::Ack);
            }
            Command::ReplicaOf { id, target } => {
                self.send(&id, cmd::replicaof(target), ReplyKind::Ack);
            }
            Command::ConfigPersist { id } => {
                self.send(&id, cmd::config_rewrite(), ReplyKind::Ack);
            }
            Command::ScriptKill { id } => self.send(&id, cmd::script_kill(), ReplyKind::Ack),
            Command::AskIsPrimaryDown {
                id,
                primary_addr,
                epoch,
                runid,
            } => {
                self.send(
                    &id,
                    cmd::is_primary_down_by_addr(primary_addr, epoch, &runid),
                    ReplyKind::IsDown,
                );
            }
        }
    }

    fn send(&self, id: &InstanceId, frame: Frame, reply: ReplyKind) {
        if let Some(handle) = self.links.get(&(id.clone(), LinkKind::Command)) {
            handle.send(LinkRequest { frame, reply });
        } else {
            debug!(%id, "dropping command for absent link");
        }
    }

    // ========================================================================
    // Link events
    // ========================================================================

    fn on_link_event(&mut self, event: LinkEvent) {
        let now = self.clock.now_ms();
        let out = match event {
            LinkEvent::Up {
                id,
                kind,
                generation,
            } => self.engine.link_established(&id, kind, generation, now),
            LinkEvent::Down {
                id,
                kind,
                generation,
            } => {
                if let Some(handle) = self.links.get(&(id.clone(), kind)) {
                    if handle.generation == generation {
                        if let Some(handle) = self.links.remove(&(id.clone(), kind)) {
                            handle.abort();
                        }
                    }
                }
                self.engine.link_lost(&id, kind, generation, now)
            }
            LinkEvent::PingReply {
                id,
                generation,
                text,
            } => self.engine.ping_reply(&id, generation, &text, now),
            LinkEvent::InfoReply {
                id,
                generation,
                text,
            } => self.engine.info_reply(&id, generation, &text, now),
            LinkEvent::Acked { id, generation } => {
                self.engine.command_acked(&id, generation, now);
                EngineOutput::empty()
            }
            LinkEvent::IsDownReply {
                id,
                generation,
                reply,
            } => self
                .engine
                .is_down_reply(&id.primary, &id.name, generation, &reply, now),
            LinkEvent::Hello { payload } => self.engine.hello_received(&payload, now),
            LinkEvent::PubsubActivity { id } => {
                self.engine.pubsub_activity(&id, now);
                EngineOutput::empty()
            }
        };
        self.apply(out, now);
    }

    // ========================================================================
    // RPC
    // ========================================================================

    fn on_rpc(&mut self, request: RpcRequest) {
        let now = self.clock.now_ms();
        let frame = match request.command {
            RpcCommand::Ping => Frame::Simple("PONG".to_string()),
            RpcCommand::IsPrimaryDown {
                ip,
                port,
                epoch,
                runid,
            } => {
                let (reply, out) = self
                    .engine
                    .handle_is_down_request(&ip, port, epoch, &runid, now);
                self.apply(out, now);
                Frame::Array(vec![
                    Frame::Integer(i64::from(reply.is_down)),
                    Frame::bulk(reply.leader.into_bytes()),
                    Frame::Integer(reply.leader_epoch.as_u64() as i64),
                ])
            }
            RpcCommand::Masters => Frame::Array(
                self.engine
                    .describe_primaries(now)
                    .iter()
                    .map(|fields| encode_fields(fields))
                    .collect(),
            ),
            RpcCommand::Slaves(name) => match self.engine.describe_replicas(&name, now) {
                Ok(all) => {
                    Frame::Array(all.iter().map(|fields| encode_fields(fields)).collect())
                }
                Err(err) => Frame::Error(format!("ERR {err}")),
            },
            RpcCommand::Sentinels(name) => match self.engine.describe_peers(&name, now) {
                Ok(all) => {
                    Frame::Array(all.iter().map(|fields| encode_fields(fields)).collect())
                }
                Err(err) => Frame::Error(format!("ERR {err}")),
            },
            RpcCommand::GetPrimaryAddr(name) => match self.engine.primary_addr(&name) {
                Ok(addr) => Frame::Array(vec![
                    Frame::bulk(addr.ip.to_string().into_bytes()),
                    Frame::bulk(addr.port.to_string().into_bytes()),
                ]),
                Err(_) => Frame::Null,
            },
            RpcCommand::Reset(pattern) => {
                let (matched, out) = self.engine.reset_matching(&pattern, now);
                self.apply(out, now);
                Frame::Integer(matched as i64)
            }
            RpcCommand::Failover(name) => match self.engine.force_failover(&name, now) {
                Ok(()) => Frame::Simple("OK".to_string()),
                Err(err) => Frame::Error(format!("ERR {err}")),
            },
            RpcCommand::PendingScripts => Frame::Array(
                self.scripts
                    .pending(now)
                    .iter()
                    .map(|job| {
                        encode_fields(&[
                            ("argv".to_string(), job.argv.join(" ")),
                            (
                                "flags".to_string(),
                                if job.running { "running" } else { "scheduled" }.to_string(),
                            ),
                            (
                                "pid".to_string(),
                                job.pid.map(|p| p.to_string()).unwrap_or_default(),
                            ),
                            ("retry-num".to_string(), job.retry.to_string()),
                            ("ms".to_string(), job.ms.to_string()),
                        ])
                    })
                    .collect(),
            ),
        };
        request.reply.send(frame).ok();
    }
}

// ============================================================================
// Event logging
// ============================================================================

fn log_events(events: &[Event]) {
    for event in events {
        log_event(event);
    }
}

fn log_event(event: &Event) {
    match event.level {
        EventLevel::Warning => warn!(kind = %event.kind, "{event}"),
        EventLevel::Info => info!(kind = %event.kind, "{event}"),
        EventLevel::Debug => debug!(kind = %event.kind, "{event}"),
    }
}
