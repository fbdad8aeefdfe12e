//! Process-group collectives
//!
//! Ranks of one model-parallel group talk through a star of TCP connections
//! rooted at rank 0. Every collective is blocking: rank 0 gathers one frame
//! from each peer, combines them, and sends the combined frame back.
//!
//! Frames are a little-endian `u64` length followed by a bincode payload.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// How long a peer waits for rank 0 to start listening.
const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(60);
const RENDEZVOUS_POLL: Duration = Duration::from_millis(100);
/// Largest frame a peer may announce
const MAX_FRAME_LEN: u64 = 1 << 30;

/// Serialized tensor format for transmission between ranks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedTensor {
    /// Shape of the tensor (e.g., [batch, seq_len, hidden_dim])
    pub shape: Vec<usize>,
    pub dtype: String,
    /// Raw little-endian element bytes
    pub data: Vec<u8>,
    pub checksum: [u8; 32],
}

impl SerializedTensor {
    /// Copy a tensor to host memory and encode it.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let dtype = format!("{:?}", tensor.dtype());
        let flat = tensor.flatten_all()?;

        let data: Vec<u8> = match tensor.dtype() {
            DType::F32 => flat
                .to_vec1::<f32>()?
                .into_iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            DType::F16 => flat
                .to_vec1::<half::f16>()?
                .into_iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            DType::BF16 => flat
                .to_vec1::<half::bf16>()?
                .into_iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            _ => return Err(CoreError::UnsupportedDtype(dtype)),
        };

        let checksum = *blake3::hash(&data).as_bytes();

        Ok(Self {
            shape,
            dtype,
            data,
            checksum,
        })
    }

    /// Decode onto `device`, verifying the checksum first.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        if blake3::hash(&self.data).as_bytes() != &self.checksum {
            return Err(CoreError::ChecksumMismatch);
        }

        let tensor = match self.dtype.as_str() {
            "F32" => {
                let values: Vec<f32> = self
                    .data
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Tensor::from_vec(values, self.shape.as_slice(), device)?
            }
            "F16" => {
                let values: Vec<half::f16> = self
                    .data
                    .chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Tensor::from_vec(values, self.shape.as_slice(), device)?
            }
            "BF16" => {
                let values: Vec<half::bf16> = self
                    .data
                    .chunks_exact(2)
                    .map(|c| half::bf16::from_le_bytes([c[0], c[1]]))
                    .collect();
                Tensor::from_vec(values, self.shape.as_slice(), device)?
            }
            other => return Err(CoreError::UnsupportedDtype(other.to_string())),
        };

        Ok(tensor)
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Hello { rank: usize },
    Tensor(SerializedTensor),
    Value(u64),
}

/// Members of one model-parallel group.
///
/// A group of size 1 owns no sockets and every collective is the identity.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    /// On rank 0: one stream per peer, indexed by `rank - 1`.
    /// On other ranks: the single stream to rank 0.
    streams: Vec<TcpStream>,
}

impl ProcessGroup {
    /// A group containing only this process.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            streams: Vec::new(),
        }
    }

    /// Join the group whose rank 0 listens on `addr`.
    pub fn connect(rank: usize, world_size: usize, addr: &str) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(CoreError::InvalidTopology(format!(
                "rank {rank} is not part of a group of size {world_size}"
            )));
        }
        if world_size == 1 {
            return Ok(Self::single());
        }

        if rank == 0 {
            let listener = TcpListener::bind(addr)?;
            info!("Process group listening on {} for {} peers", addr, world_size - 1);
            Self::accept_peers(&listener, world_size)
        } else {
            let stream = Self::dial(addr)?;
            stream.set_nodelay(true)?;
            write_frame(&stream, &Frame::Hello { rank })?;
            debug!("Rank {} joined process group at {}", rank, addr);
            Ok(Self {
                rank,
                world_size,
                streams: vec![stream],
            })
        }
    }

    /// Accept every peer of a group on an already bound listener.
    pub fn accept_peers(listener: &TcpListener, world_size: usize) -> Result<Self> {
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        for _ in 1..world_size {
            let (stream, peer_addr) = listener.accept()?;
            stream.set_nodelay(true)?;
            let peer = match read_frame(&stream)? {
                Frame::Hello { rank } => rank,
                other => {
                    return Err(CoreError::Protocol(format!(
                        "expected hello from {peer_addr}, got {other:?}"
                    )))
                }
            };
            let slot = peer
                .checked_sub(1)
                .and_then(|idx| slots.get_mut(idx))
                .ok_or_else(|| CoreError::Protocol(format!("unexpected peer rank {peer}")))?;
            if slot.is_some() {
                return Err(CoreError::Protocol(format!("rank {peer} joined twice")));
            }
            debug!("Rank {} connected from {}", peer, peer_addr);
            *slot = Some(stream);
        }

        let streams = slots.into_iter().flatten().collect();
        Ok(Self {
            rank: 0,
            world_size,
            streams,
        })
    }

    fn dial(addr: &str) -> Result<TcpStream> {
        let deadline = Instant::now() + RENDEZVOUS_TIMEOUT;
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) if Instant::now() < deadline => {
                    debug!("Waiting for rank 0 at {}: {}", addr, e);
                    std::thread::sleep(RENDEZVOUS_POLL);
                }
                Err(e) => {
                    return Err(CoreError::Transport(format!(
                        "rank 0 never became reachable at {addr}: {e}"
                    )))
                }
            }
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Element-wise sum of `tensor` over all ranks.
    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        self.exchange(tensor, |parts| {
            let mut acc = parts[0].clone();
            for part in &parts[1..] {
                acc = (acc + part)?;
            }
            Ok(acc)
        })
    }

    /// Concatenation of every rank's `tensor` along `dim`, in rank order.
    pub fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        if self.world_size == 1 {
            return Ok(tensor.clone());
        }
        self.exchange(tensor, |parts| Ok(Tensor::cat(parts, dim)?))
    }

    /// Rank 0's `value`, seen by every rank.
    pub fn broadcast_u64(&self, value: u64) -> Result<u64> {
        if self.world_size == 1 {
            return Ok(value);
        }
        if self.rank == 0 {
            for stream in &self.streams {
                write_frame(stream, &Frame::Value(value))?;
            }
            Ok(value)
        } else {
            match read_frame(&self.streams[0])? {
                Frame::Value(v) => Ok(v),
                other => Err(CoreError::Protocol(format!("expected value, got {other:?}"))),
            }
        }
    }

    /// Block until every rank reached this point.
    pub fn barrier(&self) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }
        if self.rank == 0 {
            for stream in &self.streams {
                expect_value(stream)?;
            }
            for stream in &self.streams {
                write_frame(stream, &Frame::Value(0))?;
            }
        } else {
            write_frame(&self.streams[0], &Frame::Value(self.rank as u64))?;
            expect_value(&self.streams[0])?;
        }
        Ok(())
    }

    fn exchange<F>(&self, tensor: &Tensor, combine: F) -> Result<Tensor>
    where
        F: FnOnce(&[Tensor]) -> Result<Tensor>,
    {
        let device = tensor.device().clone();
        if self.rank == 0 {
            let mut parts = Vec::with_capacity(self.world_size);
            parts.push(tensor.clone());
            for stream in &self.streams {
                parts.push(expect_tensor(stream, &device)?);
            }
            let combined = combine(&parts)?;
            let frame = Frame::Tensor(SerializedTensor::from_tensor(&combined)?);
            for stream in &self.streams {
                write_frame(stream, &frame)?;
            }
            Ok(combined)
        } else {
            let frame = Frame::Tensor(SerializedTensor::from_tensor(tensor)?);
            write_frame(&self.streams[0], &frame)?;
            expect_tensor(&self.streams[0], &device)
        }
    }
}

fn expect_tensor(stream: &TcpStream, device: &Device) -> Result<Tensor> {
    match read_frame(stream)? {
        Frame::Tensor(t) => t.to_tensor(device),
        other => Err(CoreError::Protocol(format!("expected tensor, got {other:?}"))),
    }
}

fn expect_value(stream: &TcpStream) -> Result<u64> {
    match read_frame(stream)? {
        Frame::Value(v) => Ok(v),
        other => Err(CoreError::Protocol(format!("expected value, got {other:?}"))),
    }
}

fn write_frame<T: Serialize>(mut stream: &TcpStream, frame: &T) -> Result<()> {
    let data = bincode::serialize(frame)?;
    let len = data.len() as u64;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&data)?;
    stream.flush()?;
    Ok(())
}

fn read_frame<T: DeserializeOwned>(mut stream: &TcpStream) -> Result<T> {
    let mut len_buf = [0u8; 8];
    stream.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CoreError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data)?;
    Ok(bincode::deserialize(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Spin up a loopback group and run `f` on every rank.
    fn run_group<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(ProcessGroup) -> T + Send + Sync + Clone + 'static,
        T: Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut handles = Vec::new();
        for rank in 1..world_size {
            let addr = addr.clone();
            let f = f.clone();
            handles.push(thread::spawn(move || {
                let group = ProcessGroup::connect(rank, world_size, &addr).unwrap();
                f(group)
            }));
        }

        let root = ProcessGroup::accept_peers(&listener, world_size).unwrap();
        let mut results = vec![f(root)];
        for handle in handles {
            results.push(handle.join().unwrap());
        }
        results
    }

    #[test]
    fn test_serialized_tensor_rejects_corruption() {
        let t = Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap();
        let mut s = SerializedTensor::from_tensor(&t).unwrap();
        s.data[0] ^= 0xff;
        assert!(matches!(
            s.to_tensor(&Device::Cpu),
            Err(CoreError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.write_all(&u64::MAX.to_le_bytes()).unwrap();
        let err = read_frame::<u64>(&server).unwrap_err();
        assert!(matches!(err, CoreError::Protocol(_)));
    }

    #[test]
    fn test_serialized_tensor_bf16() {
        let t = Tensor::new(&[[1f32, -2.], [0.5, 4.]], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::BF16)
            .unwrap();
        let back = SerializedTensor::from_tensor(&t)
            .unwrap()
            .to_tensor(&Device::Cpu)
            .unwrap();
        assert_eq!(back.dtype(), DType::BF16);
        assert_eq!(back.dims(), &[2, 2]);
        let values = back.to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(values, vec![vec![1., -2.], vec![0.5, 4.]]);
    }

    #[test]
    fn test_single_group_is_identity() {
        let group = ProcessGroup::single();
        let t = Tensor::new(&[1f32, 2.], &Device::Cpu).unwrap();
        let reduced = group.all_reduce_sum(&t).unwrap();
        assert_eq!(reduced.to_vec1::<f32>().unwrap(), vec![1., 2.]);
        assert_eq!(group.broadcast_u64(7).unwrap(), 7);
        group.barrier().unwrap();
    }

    #[test]
    fn test_all_reduce_sum() {
        let results = run_group(3, |group| {
            let v = group.rank() as f32 + 1.0;
            let t = Tensor::new(&[v, 10.0 * v], &Device::Cpu).unwrap();
            group.all_reduce_sum(&t).unwrap().to_vec1::<f32>().unwrap()
        });
        for r in results {
            assert_eq!(r, vec![6.0, 60.0]);
        }
    }

    #[test]
    fn test_all_gather_rank_order() {
        let results = run_group(2, |group| {
            let v = group.rank() as f32;
            let t = Tensor::new(&[[v, v]], &Device::Cpu).unwrap();
            group.all_gather(&t, 1).unwrap().to_vec2::<f32>().unwrap()
        });
        for r in results {
            assert_eq!(r, vec![vec![0.0, 0.0, 1.0, 1.0]]);
        }
    }

    #[test]
    fn test_broadcast_and_barrier() {
        let results = run_group(3, |group| {
            group.barrier().unwrap();
            group.broadcast_u64(100 + group.rank() as u64).unwrap()
        });
        assert_eq!(results, vec![100, 100, 100]);
    }
}
