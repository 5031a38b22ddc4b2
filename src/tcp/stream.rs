use std::cmp;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use crate::{Error, Manager};

use super::Quad;

#[derive(Debug)]
pub struct TcpStream {
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) quad: Quad,
    pub(crate) closed: bool,
}

fn stream_closed(quad: Quad) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, Error::StreamClosed(quad.dst))
}

impl TcpStream {
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut manager = self.manager.lock().unwrap();
        let Some(tcb) = manager.conns.get_mut(&self.quad) else {
            return;
        };
        let emissions = tcb.close();
        for emission in emissions {
            manager.outbox.push_back((self.quad, emission));
        }
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut manager = self.manager.lock().unwrap();

        let wait_recv = manager
            .conns
            .get(&self.quad)
            .ok_or_else(|| stream_closed(self.quad))?
            .wait_recv
            .clone();

        let needs_wait = manager
            .conns
            .get(&self.quad)
            .map(|tcb| tcb.incoming.is_empty() && !tcb.is_read_closed())
            .unwrap_or(false);

        if needs_wait {
            manager = wait_recv.wait_while(manager, |manager| {
                manager
                    .conns
                    .get(&self.quad)
                    .map_or(false, |tcb| tcb.incoming.is_empty() && !tcb.is_read_closed())
            });
        }

        let tcb = manager
            .conns
            .get_mut(&self.quad)
            .ok_or_else(|| stream_closed(self.quad))?;

        let len = cmp::min(buf.len(), tcb.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(tcb.incoming.drain(..len)) {
            *slot = byte;
        }

        Ok(len)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write half of the stream is closed",
            ));
        }

        let mut manager = self.manager.lock().unwrap();

        let wait_send = manager
            .conns
            .get(&self.quad)
            .ok_or_else(|| stream_closed(self.quad))?
            .wait_send
            .clone();

        let needs_wait = manager
            .conns
            .get(&self.quad)
            .map(|tcb| tcb.is_outgoing_full())
            .unwrap_or(false);

        if needs_wait {
            manager = wait_send.wait_while(manager, |manager| {
                manager
                    .conns
                    .get(&self.quad)
                    .map_or(false, |tcb| tcb.is_outgoing_full())
            });
        }

        let tcb = manager
            .conns
            .get_mut(&self.quad)
            .ok_or_else(|| stream_closed(self.quad))?;

        if tcb.is_write_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "write half of the stream is closed",
            ));
        }

        let len = cmp::min(buf.len(), tcb.outgoing_remaining());
        tcb.outgoing.extend(buf[..len].iter().copied());

        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut manager = self.manager.lock().unwrap();

        let wait_send = manager
            .conns
            .get(&self.quad)
            .ok_or_else(|| stream_closed(self.quad))?
            .wait_send
            .clone();

        let needs_wait = manager
            .conns
            .get(&self.quad)
            .map(|tcb| !tcb.outgoing.is_empty())
            .unwrap_or(false);

        if needs_wait {
            manager = wait_send.wait_while(manager, |manager| {
                manager
                    .conns
                    .get(&self.quad)
                    .map_or(false, |tcb| !tcb.outgoing.is_empty())
            });
        }

        manager
            .conns
            .get(&self.quad)
            .ok_or_else(|| stream_closed(self.quad))?;

        Ok(())
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}
