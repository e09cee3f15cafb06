use crate::{enums::ErrorType, stream::Stream, types::*};
use log::debug;
use std::collections::{HashMap, VecDeque};

/// How many closed stream ids we remember, to tell "frame on a just-closed
/// stream" (STREAM_CLOSED) apart from "frame on a stream that never was"
/// (PROTOCOL_ERROR).
const CLOSED_MEMORY: usize = 64;

pub(crate) enum Admission<'a> {
    Created(&'a mut Stream),
    /// Over the advertised MAX_CONCURRENT_STREAMS; answer RST_STREAM(REFUSED_STREAM).
    Refused,
}

/// The dispatcher's ledger of live streams. Single-owner: nothing outside
/// the dispatcher task touches it.
pub(crate) struct StreamCoordinator {
    streams: HashMap<NonZeroStreamId, Stream>,
    closed: VecDeque<NonZeroStreamId>,
    pub last_peer_stream_id: StreamId,
    next_local_id: StreamId,
    /// Peer's INITIAL_WINDOW_SIZE; seeds the send window of new streams.
    pub initial_send_window: i64,
    /// Our advertised INITIAL_WINDOW_SIZE; seeds receive windows.
    pub initial_recv_window: i64,
}

impl StreamCoordinator {
    pub fn new(initial_send_window: i64, initial_recv_window: i64) -> Self {
        Self {
            streams: HashMap::new(),
            closed: VecDeque::with_capacity(CLOSED_MEMORY),
            last_peer_stream_id: 0,
            next_local_id: 1,
            initial_send_window,
            initial_recv_window,
        }
    }

    pub fn get_mut(&mut self, id: NonZeroStreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Streams in open or half-closed states; closed ones leave the map.
    pub fn open_count(&self) -> usize {
        self.streams.len()
    }

    pub fn was_recently_closed(&self, id: NonZeroStreamId) -> bool {
        self.closed.contains(&id)
    }

    /// Admits a peer-initiated stream (server role). Client-initiated ids
    /// must be odd and strictly increasing.
    pub fn open_remote(
        &mut self,
        id: NonZeroStreamId,
        max_concurrent: u32,
    ) -> Result<Admission<'_>, H2Error> {
        if id.get() % 2 == 0 {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                "client-initiated stream id must be odd",
            ));
        }
        if id.get() <= self.last_peer_stream_id {
            return Err(H2Error::connection(
                ErrorType::ProtocolError,
                "stream id not strictly increasing",
            ));
        }
        self.last_peer_stream_id = id.get();
        if self.streams.len() >= max_concurrent as usize {
            debug!("refusing stream {id}: {} streams open", self.streams.len());
            self.remember_closed(id);
            return Ok(Admission::Refused);
        }
        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, self.initial_send_window, self.initial_recv_window));
        Ok(Admission::Created(stream))
    }

    /// Opens the next locally-initiated stream (client role: odd, ascending).
    pub fn open_local(&mut self) -> Result<&mut Stream, H2Error> {
        let id = NonZeroStreamId::new(self.next_local_id).ok_or_else(|| {
            H2Error::connection(ErrorType::InternalError, "stream id counter wrapped")
        })?;
        if id.get() > U31_MAX {
            return Err(H2Error::connection(
                ErrorType::InternalError,
                "stream ids exhausted",
            ));
        }
        self.next_local_id += 2;
        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, self.initial_send_window, self.initial_recv_window));
        Ok(stream)
    }

    pub fn close(&mut self, id: NonZeroStreamId) {
        if self.streams.remove(&id).is_some() {
            self.remember_closed(id);
        }
    }

    fn remember_closed(&mut self, id: NonZeroStreamId) {
        if self.closed.len() == CLOSED_MEMORY {
            self.closed.pop_front();
        }
        self.closed.push_back(id);
    }

    /// Retroactive resize after the peer changed INITIAL_WINDOW_SIZE: every
    /// live stream's send window moves by the delta (RFC 7540 §6.9.2).
    pub fn apply_initial_window_delta(&mut self, delta: i64) -> Result<(), H2Error> {
        for stream in self.streams.values_mut() {
            stream.send_window += delta;
            if stream.send_window > MAX_WINDOW {
                return Err(H2Error::connection(
                    ErrorType::FlowControlError,
                    "INITIAL_WINDOW_SIZE change overflowed a stream window",
                ));
            }
        }
        Ok(())
    }

    pub fn streams_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Snapshot of live ids, for walks that close streams along the way.
    pub fn ids(&self) -> Vec<NonZeroStreamId> {
        self.streams.keys().copied().collect()
    }
}
