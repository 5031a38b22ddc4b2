use std::sync::{Arc, Mutex};

use crate::{Error, Manager};

use super::stream::TcpStream;
use super::tcb::WaitCell;

#[derive(Debug)]
pub struct TcpListener {
    pub(crate) port: u16,
    pub(crate) manager: Arc<Mutex<Manager>>,
    pub(crate) cvar: WaitCell,
}

impl TcpListener {
    pub fn accept(&self) -> Result<TcpStream, Error> {
        let mut manager = self.manager.lock().unwrap();

        let needs_wait = manager
            .listeners
            .get(&self.port)
            .ok_or(Error::PortClosed(self.port))?
            .accept_queue
            .is_empty();

        if needs_wait {
            manager = self.cvar.wait_while(manager, |manager| {
                manager
                    .listeners
                    .get(&self.port)
                    .map_or(false, |entry| entry.accept_queue.is_empty())
            });
        }

        let entry = manager
            .listeners
            .get_mut(&self.port)
            .ok_or(Error::PortClosed(self.port))?;
        let quad = entry
            .accept_queue
            .pop_front()
            .ok_or(Error::PortClosed(self.port))?;

        Ok(TcpStream {
            manager: self.manager.clone(),
            quad,
            closed: false,
        })
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        let mut manager = self.manager.lock().unwrap();
        manager.listeners.remove(&self.port);
    }
}
