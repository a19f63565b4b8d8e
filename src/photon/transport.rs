//! Reliable-UDP transport parsing and fragment reassembly.
//!
//! Each datagram carries a 4-byte header and 1..N commands. Unreliable and
//! reliable commands hold a complete message body; fragment commands carve
//! one logical message across datagrams. Reassembly is keyed per
//! `(flow, sequence)` with a received-fragment bitset, and completed
//! messages are emitted in last-fragment-arrival order, which is the order
//! the client observably applies effects in.
//!
//! Resource rules: buffers idle past the timeout are collected, and the
//! whole arena is byte-capped with oldest-incomplete eviction. Backing
//! storage comes from a size-class pool so steady-state fragmentation does
//! not allocate.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::capture::FlowKey;
use crate::config::Limits;

pub const CMD_UNRELIABLE: u8 = 6;
pub const CMD_RELIABLE: u8 = 7;
pub const CMD_FRAGMENT: u8 = 8;

const DATAGRAM_HEADER_LEN: usize = 4;
const COMMAND_HEADER_LEN: usize = 12;
const FRAGMENT_PREFIX_LEN: usize = 20;

/// A complete message body above the transport layer.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub channel: u8,
    pub reliable: bool,
    pub seq: u16,
    pub body: Bytes,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportCounters {
    /// Datagrams too short for the header or with garbage lengths.
    pub malformed_datagrams: u64,
    /// Commands with a type we do not handle.
    pub unknown_commands: u64,
    /// Buffers dropped for inconsistent fragment metadata.
    pub reassembly_failed: u64,
    /// Buffers collected by timeout or arena-cap eviction.
    pub reassembly_evicted: u64,
}

struct ReassemblyBuf {
    data: Vec<u8>,
    received: Vec<bool>,
    fragment_count: usize,
    received_count: usize,
    total_length: usize,
    last_touch: f64,
}

pub struct Reassembler {
    buffers: BTreeMap<(FlowKey, i32), ReassemblyBuf>,
    pool: BufferPool,
    arena_bytes: usize,
    arena_cap: usize,
    timeout_s: f64,
    last_gc: f64,
    pub counters: TransportCounters,
}

impl Reassembler {
    pub fn new(limits: &Limits) -> Self {
        Self {
            buffers: BTreeMap::new(),
            pool: BufferPool::default(),
            arena_bytes: 0,
            arena_cap: limits.reassembly_arena_bytes,
            timeout_s: limits.reassembly_timeout_seconds,
            last_gc: 0.0,
            counters: TransportCounters::default(),
        }
    }

    /// Parse one datagram, appending any completed messages to `out`.
    ///
    /// Malformed input never aborts the datagram walk beyond the point of
    /// corruption: earlier commands in the same datagram still count.
    pub fn ingest(&mut self, flow: FlowKey, ts: f64, payload: &[u8], out: &mut Vec<TransportMessage>) {
        if ts - self.last_gc >= 1.0 {
            self.gc(ts);
            self.last_gc = ts;
        }

        if payload.len() < DATAGRAM_HEADER_LEN {
            self.counters.malformed_datagrams += 1;
            return;
        }
        let command_count = payload[3] as usize;
        let mut offset = DATAGRAM_HEADER_LEN;

        for _ in 0..command_count {
            let Some(header) = payload.get(offset..offset + COMMAND_HEADER_LEN) else {
                self.counters.malformed_datagrams += 1;
                return;
            };
            let command_type = header[0];
            let channel = header[1];
            let length = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let reliable_seq = i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
            if length < COMMAND_HEADER_LEN as i32 {
                self.counters.malformed_datagrams += 1;
                return;
            }
            let end = offset + length as usize;
            let Some(body) = payload.get(offset + COMMAND_HEADER_LEN..end) else {
                self.counters.malformed_datagrams += 1;
                return;
            };

            match command_type {
                CMD_UNRELIABLE | CMD_RELIABLE => out.push(TransportMessage {
                    channel,
                    reliable: command_type == CMD_RELIABLE,
                    seq: reliable_seq as u16,
                    body: Bytes::copy_from_slice(body),
                }),
                CMD_FRAGMENT => {
                    if let Some(message) = self.ingest_fragment(flow, ts, channel, body) {
                        out.push(message);
                    }
                }
                _ => self.counters.unknown_commands += 1,
            }

            offset = end;
        }
    }

    fn ingest_fragment(
        &mut self,
        flow: FlowKey,
        ts: f64,
        channel: u8,
        body: &[u8],
    ) -> Option<TransportMessage> {
        if body.len() < FRAGMENT_PREFIX_LEN {
            self.counters.malformed_datagrams += 1;
            return None;
        }
        let sequence = read_i32(body, 0);
        let fragment_count = read_i32(body, 4);
        let fragment_number = read_i32(body, 8);
        let total_length = read_i32(body, 12);
        let fragment_offset = read_i32(body, 16);
        let fragment_bytes = &body[FRAGMENT_PREFIX_LEN..];

        if fragment_count <= 0 || total_length < 0 || fragment_number < 0 || fragment_offset < 0 {
            self.counters.reassembly_failed += 1;
            return None;
        }
        let fragment_count = fragment_count as usize;
        let fragment_number = fragment_number as usize;
        let total_length = total_length as usize;
        let fragment_offset = fragment_offset as usize;

        // Out-of-range fragments are noise from a different dialect or a
        // corrupted record; they do not poison an existing buffer.
        if fragment_number >= fragment_count
            || fragment_offset + fragment_bytes.len() > total_length
        {
            return None;
        }
        // No single message may claim the whole arena.
        if total_length > self.arena_cap {
            self.counters.reassembly_failed += 1;
            return None;
        }

        let key = (flow, sequence);
        if let Some(buf) = self.buffers.get(&key) {
            if buf.total_length != total_length || buf.fragment_count != fragment_count {
                tracing::warn!(
                    sequence,
                    expected = buf.total_length,
                    got = total_length,
                    "reassembly failed: fragment metadata mismatch"
                );
                self.drop_buffer(&key);
                self.counters.reassembly_failed += 1;
                return None;
            }
        } else {
            self.reserve(total_length);
            let mut data = self.pool.get(total_length);
            data.resize(total_length, 0);
            self.buffers.insert(
                key,
                ReassemblyBuf {
                    data,
                    received: vec![false; fragment_count],
                    fragment_count,
                    received_count: 0,
                    total_length,
                    last_touch: ts,
                },
            );
            self.arena_bytes += total_length;
        }

        let complete = {
            let buf = self.buffers.get_mut(&key)?;
            buf.last_touch = ts;
            buf.data[fragment_offset..fragment_offset + fragment_bytes.len()]
                .copy_from_slice(fragment_bytes);
            if !buf.received[fragment_number] {
                buf.received[fragment_number] = true;
                buf.received_count += 1;
            }
            buf.received_count == buf.fragment_count
        };
        if !complete {
            return None;
        }

        let buf = self.buffers.remove(&key)?;
        self.arena_bytes -= buf.total_length;
        let body = Bytes::copy_from_slice(&buf.data);
        self.pool.put(buf.data);
        Some(TransportMessage {
            channel,
            reliable: true,
            seq: sequence as u16,
            body,
        })
    }

    /// Evict oldest incomplete buffers until `additional` bytes fit.
    fn reserve(&mut self, additional: usize) {
        while self.arena_bytes + additional > self.arena_cap {
            let Some(oldest) = self
                .buffers
                .iter()
                .min_by(|a, b| {
                    a.1.last_touch
                        .partial_cmp(&b.1.last_touch)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(key, _)| *key)
            else {
                return;
            };
            tracing::warn!(sequence = oldest.1, "reassembly arena full, evicting oldest buffer");
            self.drop_buffer(&oldest);
            self.counters.reassembly_evicted += 1;
        }
    }

    fn gc(&mut self, now: f64) {
        let timeout = self.timeout_s;
        let expired: Vec<(FlowKey, i32)> = self
            .buffers
            .iter()
            .filter(|(_, buf)| now - buf.last_touch > timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in expired {
            tracing::debug!(sequence = key.1, "reassembly buffer timed out");
            self.drop_buffer(&key);
            self.counters.reassembly_evicted += 1;
        }
    }

    fn drop_buffer(&mut self, key: &(FlowKey, i32)) {
        if let Some(buf) = self.buffers.remove(key) {
            self.arena_bytes -= buf.total_length;
            self.pool.put(buf.data);
        }
    }

    #[cfg(test)]
    fn pending_buffers(&self) -> usize {
        self.buffers.len()
    }
}

fn read_i32(data: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Power-of-two size-class free list for reassembly backing storage.
#[derive(Default)]
struct BufferPool {
    classes: BTreeMap<usize, Vec<Vec<u8>>>,
}

impl BufferPool {
    const MAX_PER_CLASS: usize = 8;

    fn get(&mut self, len: usize) -> Vec<u8> {
        let class = len.next_power_of_two();
        if let Some(free) = self.classes.get_mut(&class) {
            if let Some(mut buf) = free.pop() {
                buf.clear();
                return buf;
            }
        }
        Vec::with_capacity(class)
    }

    fn put(&mut self, buf: Vec<u8>) {
        let class = buf.capacity().next_power_of_two();
        let free = self.classes.entry(class).or_default();
        if free.len() < Self::MAX_PER_CLASS {
            free.push(buf);
        }
    }
}
