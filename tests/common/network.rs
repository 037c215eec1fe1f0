use std::{
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use aleph_rs::{
    networking::{
        messages::{decode_chunk, encode_chunk, DagInfo},
        syncer::Syncer,
    },
    orderer::Orderer,
    types::{
        data_types::{ProcessID, UnitID},
        unit::Unit,
    },
};

/// What travels between two replicas of the mock network.
pub(crate) enum Packet {
    Units { from: ProcessID, chunk: Vec<u8> },
    Fetch { from: ProcessID, ids: Vec<UnitID> },
    Gossip { from: ProcessID, info: [Option<DagInfo>; 2] },
}

/// A mock syncer which passes requests to the other replicas' inboxes using channels.
pub(crate) struct NetworkStub {
    me: ProcessID,
    all_peers: Vec<Sender<Packet>>,
    orderer: Mutex<Weak<Orderer>>,
}

impl NetworkStub {
    /// Connect the stub to the orderer it serves. Gossip requests need its [`DagInfo`].
    pub(crate) fn attach(&self, orderer: &Arc<Orderer>) {
        *self.orderer.lock().unwrap() = Arc::downgrade(orderer);
    }

    fn send(&self, peer: ProcessID, packet: Packet) {
        if let Some(peer) = self.all_peers.get(peer.index()) {
            let _ = peer.send(packet);
        }
    }
}

impl Syncer for NetworkStub {
    fn request_fetch(&self, process: ProcessID, ids: Vec<UnitID>) {
        self.send(process, Packet::Fetch { from: self.me, ids })
    }

    fn request_gossip(&self, process: ProcessID) {
        let orderer = self.orderer.lock().unwrap().upgrade();
        if let Some(orderer) = orderer {
            let info = orderer.get_info();
            self.send(process, Packet::Gossip { from: self.me, info })
        }
    }

    fn multicast(&self, unit: &Arc<Unit>) {
        let chunk = encode_chunk(&[unit.clone()]).unwrap();
        for peer in 0..self.all_peers.len() {
            if peer != self.me.index() {
                self.send(
                    ProcessID::new(peer as u16),
                    Packet::Units {
                        from: self.me,
                        chunk: chunk.clone(),
                    },
                );
            }
        }
    }
}

/// The receiving halves of a mock network, waiting for the orderers they deliver to.
pub(crate) struct Inboxes {
    outboxes: Vec<Sender<Packet>>,
    inboxes: Vec<Receiver<Packet>>,
}

/// Create a fully connected network of `nproc` replicas: one stub per replica, and the inboxes to
/// start once the replicas are running. Packets sent before that are queued.
pub(crate) fn mock_network(nproc: usize) -> (Vec<Arc<NetworkStub>>, Inboxes) {
    let (outboxes, inboxes): (Vec<Sender<Packet>>, Vec<Receiver<Packet>>) =
        (0..nproc).map(|_| mpsc::channel()).unzip();
    let stubs = (0..nproc)
        .map(|me| {
            Arc::new(NetworkStub {
                me: ProcessID::new(me as u16),
                all_peers: outboxes.clone(),
                orderer: Mutex::new(Weak::new()),
            })
        })
        .collect();
    (stubs, Inboxes { outboxes, inboxes })
}

/// The threads delivering packets to the replicas. Stops them when dropped.
pub(crate) struct RunningNetwork {
    threads: Vec<(Sender<()>, JoinHandle<()>)>,
}

impl Inboxes {
    /// Deliver every replica's packets to `orderers[replica]`, one thread per replica.
    pub(crate) fn start(self, orderers: Vec<Arc<Orderer>>) -> RunningNetwork {
        let outboxes = self.outboxes;
        let threads = self
            .inboxes
            .into_iter()
            .zip(orderers)
            .map(|(inbox, orderer)| {
                let (shutdown, shutdown_receiver) = mpsc::channel();
                let outboxes = outboxes.clone();
                let handle = thread::spawn(move || deliver(orderer, inbox, outboxes, shutdown_receiver));
                (shutdown, handle)
            })
            .collect();
        RunningNetwork { threads }
    }
}

impl Drop for RunningNetwork {
    fn drop(&mut self) {
        for (shutdown, _) in &self.threads {
            let _ = shutdown.send(());
        }
        for (_, handle) in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn deliver(
    orderer: Arc<Orderer>,
    inbox: Receiver<Packet>,
    outboxes: Vec<Sender<Packet>>,
    shutdown: Receiver<()>,
) {
    let me = orderer.config().me;
    let reply = |to: ProcessID, units: Vec<Arc<Unit>>| {
        if units.is_empty() {
            return;
        }
        let chunk = encode_chunk(&units).unwrap();
        let _ = outboxes[to.index()].send(Packet::Units { from: me, chunk });
    };

    loop {
        if shutdown.try_recv().is_ok() {
            return;
        }
        let packet = match inbox.recv_timeout(Duration::from_millis(10)) {
            Ok(packet) => packet,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        match packet {
            Packet::Units { from, chunk } => match decode_chunk(&chunk) {
                Ok(preunits) => {
                    orderer.add_preunits(from, preunits);
                }
                Err(error) => log::warn!("undecodable chunk from {}: {:?}", from, error),
            },
            Packet::Fetch { from, ids } => reply(from, orderer.units_by_id(&ids)),
            Packet::Gossip { from, info } => reply(from, orderer.delta(&info)),
        }
    }
}
