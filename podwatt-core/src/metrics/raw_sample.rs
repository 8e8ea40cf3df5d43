//! Decoding of per-process counter records produced by the kernel-side probe.
//!
//! The probe writes one fixed-layout record per process into a BPF hash map.
//! Layout and byte order are shared with the probe and must change together:
//!
//! | offset | width | field                         |
//! |-------:|------:|-------------------------------|
//! | 0      | 8     | cgroup id                     |
//! | 8      | 8     | pid                           |
//! | 16     | 8     | process run time              |
//! | 24     | 8     | cpu cycles                    |
//! | 32     | 8     | cpu instructions              |
//! | 40     | 8     | cache misses                  |
//! | 48     | 16    | command, NUL padded           |
//! | 64     | 256   | per-CPU residency, `u16` each |
//!
//! All integers are little endian.

use thiserror::Error;

/// Number of logical CPU slots in the residency vector.
pub const CPU_VECTOR_SIZE: usize = 128;

/// Length of the command buffer (`TASK_COMM_LEN`).
pub const COMMAND_LEN: usize = 16;

const CGROUP_ID_OFFSET: usize = 0;
const PID_OFFSET: usize = 8;
const RUN_TIME_OFFSET: usize = 16;
const CPU_CYCLES_OFFSET: usize = 24;
const CPU_INSTRUCTIONS_OFFSET: usize = 32;
const CACHE_MISSES_OFFSET: usize = 40;
const COMMAND_OFFSET: usize = 48;
const CPU_TIME_OFFSET: usize = COMMAND_OFFSET + COMMAND_LEN;

/// Size in bytes of one encoded record.
pub const RECORD_SIZE: usize = CPU_TIME_OFFSET + CPU_VECTOR_SIZE * 2;

/// Errors produced while decoding a raw record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer is shorter than one record.
    #[error("record is truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// One decoded per-process counter record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProcessSample {
    pub cgroup_id: u64,
    pub pid: u64,
    /// Run time accumulated by the process since the last drain.
    pub process_run_time: u64,
    pub cpu_cycles: u64,
    pub cpu_instructions: u64,
    pub cache_misses: u64,
    pub command: String,
    /// Time the process was resident on each logical CPU.
    pub cpu_time: [u16; CPU_VECTOR_SIZE],
}

impl Default for RawProcessSample {
    fn default() -> Self {
        Self {
            cgroup_id: 0,
            pid: 0,
            process_run_time: 0,
            cpu_cycles: 0,
            cpu_instructions: 0,
            cache_misses: 0,
            command: String::new(),
            cpu_time: [0; CPU_VECTOR_SIZE],
        }
    }
}

impl RawProcessSample {
    /// Decodes one record. Bytes past [`RECORD_SIZE`] are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < RECORD_SIZE {
            return Err(DecodeError::Truncated {
                expected: RECORD_SIZE,
                actual: buf.len(),
            });
        }

        let mut cpu_time = [0u16; CPU_VECTOR_SIZE];
        for (slot, chunk) in cpu_time
            .iter_mut()
            .zip(buf[CPU_TIME_OFFSET..RECORD_SIZE].chunks_exact(2))
        {
            *slot = u16::from_le_bytes([chunk[0], chunk[1]]);
        }

        Ok(Self {
            cgroup_id: read_u64(buf, CGROUP_ID_OFFSET),
            pid: read_u64(buf, PID_OFFSET),
            process_run_time: read_u64(buf, RUN_TIME_OFFSET),
            cpu_cycles: read_u64(buf, CPU_CYCLES_OFFSET),
            cpu_instructions: read_u64(buf, CPU_INSTRUCTIONS_OFFSET),
            cache_misses: read_u64(buf, CACHE_MISSES_OFFSET),
            command: decode_command(&buf[COMMAND_OFFSET..CPU_TIME_OFFSET]),
            cpu_time,
        })
    }

    /// Encodes the record in the probe layout.
    ///
    /// Commands longer than [`COMMAND_LEN`] are cut, the same way the kernel
    /// truncates `comm`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_SIZE];
        buf[CGROUP_ID_OFFSET..PID_OFFSET].copy_from_slice(&self.cgroup_id.to_le_bytes());
        buf[PID_OFFSET..RUN_TIME_OFFSET].copy_from_slice(&self.pid.to_le_bytes());
        buf[RUN_TIME_OFFSET..CPU_CYCLES_OFFSET]
            .copy_from_slice(&self.process_run_time.to_le_bytes());
        buf[CPU_CYCLES_OFFSET..CPU_INSTRUCTIONS_OFFSET]
            .copy_from_slice(&self.cpu_cycles.to_le_bytes());
        buf[CPU_INSTRUCTIONS_OFFSET..CACHE_MISSES_OFFSET]
            .copy_from_slice(&self.cpu_instructions.to_le_bytes());
        buf[CACHE_MISSES_OFFSET..COMMAND_OFFSET].copy_from_slice(&self.cache_misses.to_le_bytes());

        let command = self.command.as_bytes();
        let len = command.len().min(COMMAND_LEN);
        buf[COMMAND_OFFSET..COMMAND_OFFSET + len].copy_from_slice(&command[..len]);

        for (chunk, value) in buf[CPU_TIME_OFFSET..]
            .chunks_exact_mut(2)
            .zip(self.cpu_time.iter())
        {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        buf
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn decode_command(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
