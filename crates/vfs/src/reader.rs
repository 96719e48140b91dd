//! Reads over a resource assembled from cached chunks.

use crate::chunks::ChunkCache;
use crate::error::{VfsError, VfsResult};
use crate::resource::Resource;
use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::io::StreamReader;

/// Boxed byte stream over a section of a resource.
pub type SectionStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Streaming reader over a section of a resource.
pub type SectionReader = StreamReader<SectionStream, Bytes>;

/// A stateful reader over a [`Resource`], backed by the shared chunk cache.
#[derive(Clone)]
pub struct RangedReader {
    resource: Arc<Resource>,
    cache: Arc<ChunkCache>,
}

impl RangedReader {
    pub fn new(resource: Arc<Resource>, cache: Arc<ChunkCache>) -> Self {
        Self { resource, cache }
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    /// Read `length` bytes at `offset`, fetching the covering chunks
    /// concurrently. Reads past the end of the resource are clamped.
    pub async fn read(&self, offset: u64, length: u64) -> VfsResult<Bytes> {
        let size = self.resource.size();
        if offset >= size {
            return Ok(Bytes::new());
        }
        let length = length.min(size - offset);
        if length == 0 {
            return Ok(Bytes::new());
        }

        let chunk_size = self.cache.chunk_size() as u64;
        let first = offset / chunk_size;
        let last = (offset + length - 1) / chunk_size;

        let fetches = (first..=last).map(|index| self.cache.fetch(&self.resource, index));
        let chunks = futures::future::try_join_all(fetches).await?;

        // Single chunk reads are the common case and need no copy.
        if chunks.len() == 1 {
            let begin = (offset - first * chunk_size) as usize;
            let chunk = &chunks[0];
            if begin + length as usize > chunk.len() {
                return Err(VfsError::Corrupted("chunk shorter than expected".into()));
            }
            return Ok(chunk.slice(begin..begin + length as usize));
        }

        let mut out = BytesMut::with_capacity(length as usize);
        let mut pos = offset;
        let end = offset + length;
        for (i, chunk) in chunks.iter().enumerate() {
            let chunk_start = (first + i as u64) * chunk_size;
            let begin = (pos - chunk_start) as usize;
            let take = ((end - pos) as usize).min(chunk.len().saturating_sub(begin));
            if take == 0 {
                return Err(VfsError::Corrupted("chunk shorter than expected".into()));
            }
            out.extend_from_slice(&chunk[begin..begin + take]);
            pos += take as u64;
        }
        Ok(out.freeze())
    }

    /// A lazy stream over `[offset, offset + length)`, yielding one cached
    /// chunk slice at a time.
    pub fn section_stream(&self, offset: u64, length: u64) -> SectionStream {
        let resource = self.resource.clone();
        let cache = self.cache.clone();
        let end = (offset + length).min(resource.size().max(offset));

        Box::pin(futures::stream::try_unfold(offset, move |pos| {
            let resource = resource.clone();
            let cache = cache.clone();
            async move {
                if pos >= end {
                    return Ok(None);
                }
                let chunk_size = cache.chunk_size() as u64;
                let index = pos / chunk_size;
                let chunk_start = index * chunk_size;

                let chunk = cache
                    .fetch(&resource, index)
                    .await
                    .map_err(std::io::Error::from)?;

                let begin = (pos - chunk_start) as usize;
                if begin >= chunk.len() {
                    return Err(std::io::Error::from(VfsError::Corrupted(
                        "chunk shorter than expected".into(),
                    )));
                }
                let take = ((end - pos) as usize).min(chunk.len() - begin);
                Ok(Some((chunk.slice(begin..begin + take), pos + take as u64)))
            }
        }))
    }

    /// An `AsyncRead`/`AsyncBufRead` over a section of the resource.
    pub fn section_reader(&self, offset: u64, length: u64) -> SectionReader {
        StreamReader::new(self.section_stream(offset, length))
    }
}
