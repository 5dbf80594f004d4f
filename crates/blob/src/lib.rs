//! Chained multi-page binary objects.
//!
//! A blob is a singly linked chain of pages identified by its head page id.
//! The head page carries the total byte length; every page carries the id of
//! the next page in the chain, 0 terminating it. Rows that logically contain
//! a blob column store the head id as an ordinary `u32` value.

#[cfg(test)]
mod tests;

use common::{DbError, DbResult, PageId};
use pager::{PAGE_HEADER, PAGE_SIZE, Pager};

// Head page: [index:4][size:4][next:4][data...]
const HEAD_SIZE: usize = PAGE_HEADER;
const HEAD_NEXT: usize = PAGE_HEADER + 4;
const HEAD_DATA: usize = PAGE_HEADER + 8;
/// Payload bytes the head page can hold.
pub const HEAD_CAPACITY: usize = PAGE_SIZE - HEAD_DATA;

// Chain page: [index:4][next:4][data...]
const CHAIN_NEXT: usize = PAGE_HEADER;
const CHAIN_DATA: usize = PAGE_HEADER + 4;
/// Payload bytes every subsequent page can hold.
pub const CHAIN_CAPACITY: usize = PAGE_SIZE - CHAIN_DATA;

/// Write `bytes` as a new blob and return its head page id. Empty input
/// allocates nothing and returns the null id.
pub fn create(pager: &mut Pager, bytes: &[u8]) -> DbResult<PageId> {
    if bytes.is_empty() {
        return Ok(PageId::NULL);
    }

    let chain_chunks = bytes.len().saturating_sub(HEAD_CAPACITY).div_ceil(CHAIN_CAPACITY);
    let mut pages = Vec::with_capacity(1 + chain_chunks);
    for _ in 0..=chain_chunks {
        pages.push(pager.alloc()?);
    }

    let head = pages[0];
    let next_of = |i: usize| pages.get(i + 1).copied().unwrap_or(PageId::NULL);

    let (head_chunk, mut rest) = bytes.split_at(bytes.len().min(HEAD_CAPACITY));
    {
        let page = expect_page(pager, head)?;
        page.write_u32(HEAD_SIZE, bytes.len() as u32);
        page.write_u32(HEAD_NEXT, next_of(0).0);
        page.data[HEAD_DATA..HEAD_DATA + head_chunk.len()].copy_from_slice(head_chunk);
    }

    for i in 1..pages.len() {
        let (chunk, tail) = rest.split_at(rest.len().min(CHAIN_CAPACITY));
        rest = tail;
        let page = expect_page(pager, pages[i])?;
        page.write_u32(CHAIN_NEXT, next_of(i).0);
        page.data[CHAIN_DATA..CHAIN_DATA + chunk.len()].copy_from_slice(chunk);
    }

    Ok(head)
}

/// Walk the chain once and concatenate the full byte content.
pub fn read_full(pager: &mut Pager, head: PageId) -> DbResult<Vec<u8>> {
    if head.is_null() {
        return Ok(Vec::new());
    }

    let (size, mut next, first) = read_head(pager, head)?;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&first);

    while !next.is_null() {
        let (chunk, following) = read_page(pager, next)?;
        out.extend_from_slice(&chunk);
        next = following;
    }

    out.truncate(size as usize);
    if out.len() < size as usize {
        return Err(DbError::Storage(format!(
            "blob {} truncated: chain holds {} of {} bytes",
            head.0,
            out.len(),
            size
        )));
    }
    Ok(out)
}

/// Read the head page: total size, next page id, and the head's payload.
pub fn read_head(pager: &mut Pager, head: PageId) -> DbResult<(u32, PageId, Vec<u8>)> {
    let page = pager
        .get(head)?
        .ok_or_else(|| DbError::Storage(format!("blob head {} not found", head.0)))?;
    let size = page.read_u32(HEAD_SIZE);
    let next = PageId(page.read_u32(HEAD_NEXT));
    let take = (size as usize).min(HEAD_CAPACITY);
    Ok((size, next, page.data[HEAD_DATA..HEAD_DATA + take].to_vec()))
}

/// Read one chain page: its payload and the next id, enabling streamed
/// reads without materializing the whole blob.
pub fn read_page(pager: &mut Pager, pid: PageId) -> DbResult<(Vec<u8>, PageId)> {
    let page = pager
        .get(pid)?
        .ok_or_else(|| DbError::Storage(format!("blob page {} not found", pid.0)))?;
    let next = PageId(page.read_u32(CHAIN_NEXT));
    Ok((page.data[CHAIN_DATA..].to_vec(), next))
}

/// Free every page of the blob. The null id is a no-op.
pub fn delete(pager: &mut Pager, head: PageId) -> DbResult<()> {
    if head.is_null() {
        return Ok(());
    }

    let (_, mut next, _) = read_head(pager, head)?;
    pager.free(head)?;
    while !next.is_null() {
        let (_, following) = read_page(pager, next)?;
        pager.free(next)?;
        next = following;
    }
    Ok(())
}

fn expect_page<'p>(pager: &'p mut Pager, pid: PageId) -> DbResult<&'p mut pager::Page> {
    pager
        .get_mut(pid)?
        .ok_or_else(|| DbError::Storage(format!("blob page {} not found", pid.0)))
}
