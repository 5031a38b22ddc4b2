use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use etherparse::{Ipv4HeaderSlice, TcpHeaderSlice};
use nix::poll::{poll, PollFd, PollFlags};
use rand::Rng;
use tidy_tuntap::Tun;
use tracing::{debug, info, trace, warn};

mod config;
pub use config::Config;

mod err;
pub use err::*;

mod tcp;
use tcp::tcb::{Action, Emission, Tcb, WaitCell};
use tcp::{ioutil, Dual, Quad};
pub use tcp::{TcpListener, TcpStream};

/// A bound listener's backlog: half-open children live in `Manager::conns`
/// like any other connection; only the quads of children that finished the
/// handshake get queued here for `accept()`.
#[derive(Debug)]
struct ListenerEntry {
    listen_tcb: Tcb,
    cvar: WaitCell,
    accept_queue: VecDeque<Quad>,
}

#[derive(Debug)]
pub struct Manager {
    iss_clock: Arc<AtomicU32>,
    listeners: HashMap<u16, ListenerEntry>,
    conns: HashMap<Quad, Tcb>,
    ephemeral_ports: HashSet<u16>,
    outbox: VecDeque<(Quad, Emission)>,
    config: Config,
}

impl Manager {
    /// A monotonically-increasing clock (ticked every 4ms by a background
    /// thread) plus a random offset, so two connections opened back to back
    /// still get visibly distinct ISNs without tracking any global counter
    /// of connections ever made.
    fn next_iss(&self) -> u32 {
        let clock = self.iss_clock.load(Ordering::Acquire);
        let offset: u32 = rand::thread_rng().gen();
        clock.wrapping_add(offset)
    }

    fn next_ephemeral_port(&mut self) -> Option<u16> {
        for port in 49152..=65535u16 {
            if !self.ephemeral_ports.contains(&port) && !self.listeners.contains_key(&port) {
                self.ephemeral_ports.insert(port);
                return Some(port);
            }
        }
        None
    }
}

#[derive(Debug)]
pub struct NetStack {
    manager: Arc<Mutex<Manager>>,
    local_addr: Ipv4Addr,
    jh: thread::JoinHandle<()>,
    ih: thread::JoinHandle<()>,
}

impl NetStack {
    pub fn new(name: &str, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self, Error> {
        Self::with_config(name, addr, mask, Config::default())
    }

    pub fn with_config(name: &str, addr: Ipv4Addr, mask: Ipv4Addr, config: Config) -> Result<Self, Error> {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();

        let tun = Tun::new(name, false)?;
        tun.set_addr(addr)?;
        tun.set_netmask(mask)?;
        tun.bring_up()?;

        let iss_clock = Arc::new(AtomicU32::new(0));

        let ih = {
            let iss_clock = iss_clock.clone();
            thread::spawn(move || loop {
                thread::sleep(Duration::from_millis(4));
                iss_clock.fetch_add(1, Ordering::Release);
            })
        };

        let manager = Arc::new(Mutex::new(Manager {
            iss_clock,
            listeners: HashMap::new(),
            conns: HashMap::new(),
            ephemeral_ports: HashSet::new(),
            outbox: VecDeque::new(),
            config,
        }));

        let jh = {
            let manager = manager.clone();
            thread::spawn(move || segment_loop(tun, manager))
        };

        info!(%name, %addr, "netstack up");

        Ok(NetStack {
            manager,
            local_addr: addr,
            jh,
            ih,
        })
    }

    pub fn bind(&mut self, port: u16) -> Result<TcpListener, Error> {
        let mut manager = self.manager.lock().unwrap();

        if manager.listeners.contains_key(&port) {
            return Err(Error::PortInUse(port));
        }

        let config = manager.config;
        let cvar = WaitCell::new();
        manager.listeners.insert(
            port,
            ListenerEntry {
                listen_tcb: Tcb::new_listen(port, config),
                cvar: cvar.clone(),
                accept_queue: VecDeque::new(),
            },
        );

        Ok(TcpListener {
            port,
            manager: self.manager.clone(),
            cvar,
        })
    }

    pub fn connect(&mut self, remote_addr: Ipv4Addr, remote_port: u16) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        let local_port = manager
            .next_ephemeral_port()
            .ok_or(Error::PortInUse(remote_port))?;

        let quad = Quad {
            src: Dual {
                ipv4: self.local_addr,
                port: local_port,
            },
            dst: Dual {
                ipv4: remote_addr,
                port: remote_port,
            },
        };

        let iss = manager.next_iss();
        let config = manager.config;
        let (tcb, syn) = Tcb::new_active(quad, iss, config);
        let wait_connect = tcb.wait_connect.clone();

        manager.conns.insert(quad, tcb);
        manager.outbox.push_back((quad, syn));

        // RST is unused by this core (spec's non-goal), so there is no
        // refusal signal to race against here: the only way out of SYN_SENT
        // is the peer's SYN|ACK landing and moving the state to ESTABLISHED.
        manager = wait_connect.wait_while(manager, |manager| {
            manager
                .conns
                .get(&quad)
                .map_or(false, |tcb| matches!(tcb.state, tcp::tcb::State::SynSent))
        });

        drop(manager);

        Ok(TcpStream {
            manager: self.manager.clone(),
            quad,
            closed: false,
        })
    }

    pub fn join(self) {
        self.jh.join().unwrap();
        self.ih.join().unwrap();
    }
}

fn drain_outbox(tun: &mut Tun, manager: &mut Manager) {
    while let Some((quad, emission)) = manager.outbox.pop_front() {
        trace!(?quad, flags = %emission.flags, seq = emission.seq, "emit");
        let bytes = ioutil::write_segment(quad, &emission);
        if let Err(err) = tun.write_all(&bytes) {
            warn!(?quad, %err, "failed to write segment to tun device");
        }
    }
}

fn apply_wake(tcb: &Tcb, wake: tcp::tcb::Wake) {
    if wake.recv {
        tcb.wait_recv.wake();
    }
    if wake.send {
        tcb.wait_send.wake();
    }
    if wake.connect {
        tcb.wait_connect.wake();
    }
}

fn segment_loop(mut tun: Tun, manager: Arc<Mutex<Manager>>) {
    loop {
        {
            let mut manager = manager.lock().unwrap();
            let Manager {
                conns, outbox, ephemeral_ports, ..
            } = &mut *manager;

            let mut to_remove = Vec::new();
            for (quad, tcb) in conns.iter_mut() {
                let (emissions, drop_conn) = tcb.on_tick();
                for emission in emissions {
                    outbox.push_back((*quad, emission));
                }
                if drop_conn {
                    to_remove.push(*quad);
                }
            }
            for quad in to_remove {
                if let Some(tcb) = conns.remove(&quad) {
                    if tcb.parent.is_none() {
                        ephemeral_ports.remove(&quad.dst.port);
                    }
                }
            }

            drain_outbox(&mut tun, &mut manager);
        }

        let mut pfd = [PollFd::new(tun.as_raw_fd(), PollFlags::POLLIN)];
        if poll(&mut pfd[..], 1).unwrap() == 0 {
            continue;
        }

        let mut buf = [0u8; 1500];
        let n = match tun.read(&mut buf) {
            Ok(n) => n,
            Err(err) => {
                warn!(%err, "tun read failed");
                continue;
            }
        };

        let Ok(ip4h) = Ipv4HeaderSlice::from_slice(&buf[..n]) else {
            continue;
        };
        let Ok(tcph) = TcpHeaderSlice::from_slice(&buf[(ip4h.ihl() * 4) as usize..n]) else {
            continue;
        };
        let data = &buf[(ip4h.ihl() * 4 + tcph.data_offset() * 4) as usize..n];

        let quad = Quad {
            src: Dual {
                ipv4: ip4h.source_addr(),
                port: tcph.source_port(),
            },
            dst: Dual {
                ipv4: ip4h.destination_addr(),
                port: tcph.destination_port(),
            },
        };

        let cb = ioutil::parse_segment(&ip4h, &tcph, data);

        let mut manager = manager.lock().unwrap();

        if manager.conns.contains_key(&quad) {
            let next_iss = manager.next_iss();
            let tcb = manager.conns.get_mut(&quad).unwrap();
            let (action, wake, emissions) = tcb.on_segment(&cb, next_iss);
            apply_wake(tcb, wake);

            match action {
                Action::Noop | Action::NewChild(_) => {}
                Action::Promote => {
                    let parent = manager.conns.get(&quad).and_then(|t| t.parent);
                    if let Some(parent_port) = parent {
                        if let Some(entry) = manager.listeners.get_mut(&parent_port) {
                            entry.accept_queue.push_back(quad);
                            entry.cvar.wake();
                        }
                    }
                }
                Action::Close => {
                    debug!(?quad, ?action, "dropping connection");
                    if let Some(tcb) = manager.conns.remove(&quad) {
                        if tcb.parent.is_none() {
                            manager.ephemeral_ports.remove(&quad.dst.port);
                        }
                    }
                }
            }

            for emission in emissions {
                manager.outbox.push_back((quad, emission));
            }
        } else if manager.listeners.contains_key(&quad.dst.port) {
            let next_iss = manager.next_iss();
            let entry = manager.listeners.get_mut(&quad.dst.port).unwrap();
            let (action, _wake, emissions) = entry.listen_tcb.on_segment(&cb, next_iss);

            for emission in emissions {
                manager.outbox.push_back((quad, emission));
            }

            if let Action::NewChild(child) = action {
                manager.conns.insert(quad, child);
            }
        } else if let Some(bytes) = ioutil::reset_for_unmatched(&ip4h, &tcph, data) {
            if let Err(err) = tun.write_all(&bytes) {
                warn!(%err, "failed to write reset for unmatched segment");
            }
        }

        drain_outbox(&mut tun, &mut manager);
    }
}
