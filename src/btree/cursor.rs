//! Ordered iteration over the entries visible to a transaction.
//!
//! A cursor holds the breadcrumbs of its current leaf and keeps that leaf
//! page alive while positioned on it. Moving past the last entry of a leaf
//! climbs the breadcrumbs to the next subtree, so the advisory `next_leaf`
//! links are never followed.

use eyre::{bail, eyre, Result};

use super::node::NodeView;
use super::search::BpTreeSearchResult;
use super::txn::{BpTxn, PageRead};

pub struct BpTreeCursor<'a, 't> {
    txn: &'a BpTxn<'t>,
    path: BpTreeSearchResult,
    page: Option<PageRead<'a>>,
}

impl<'a, 't> BpTreeCursor<'a, 't> {
    pub(crate) fn new(txn: &'a BpTxn<'t>, path: BpTreeSearchResult) -> Result<Self> {
        let mut cursor = Self {
            txn,
            path,
            page: None,
        };
        cursor.position()?;
        Ok(cursor)
    }

    fn position(&mut self) -> Result<()> {
        self.page = None;
        if !self.txn.settle(&mut self.path)? {
            return Ok(());
        }
        let leaf = self
            .path
            .leaf()
            .ok_or_else(|| eyre!("empty descent path"))?;
        self.page = Some(self.txn.page(leaf.node_id)?);
        Ok(())
    }

    fn node(&self) -> Result<(NodeView<'_>, usize)> {
        let Some(page) = self.page.as_ref() else {
            bail!("cursor is not positioned on an entry");
        };
        let index = self
            .path
            .leaf()
            .ok_or_else(|| eyre!("empty descent path"))?
            .key_index;
        Ok((NodeView::from_page(page.as_slice())?, index))
    }

    pub fn valid(&self) -> bool {
        self.page.is_some()
    }

    pub fn key(&self) -> Result<&[u8]> {
        let (node, index) = self.node()?;
        node.key(index)
    }

    /// Current value; overflow values are read in full.
    pub fn value(&self) -> Result<Vec<u8>> {
        let (node, index) = self.node()?;
        self.txn.read_value(&node, index)
    }

    pub fn advance(&mut self) -> Result<bool> {
        let Some(leaf) = self.path.leaf() else {
            return Ok(false);
        };
        if self.page.is_none() {
            return Ok(false);
        }

        let n = {
            let (node, _) = self.node()?;
            node.num_entries()
        };
        let level = self.path.depth() - 1;
        self.path.set_key_index(level, leaf.key_index + 1);

        if leaf.key_index + 1 < n {
            return Ok(true);
        }
        self.position()?;
        Ok(self.valid())
    }

    /// Collects the remaining entries as owned pairs.
    pub fn collect_remaining(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        while self.valid() {
            out.push((self.key()?.to_vec(), self.value()?));
            self.advance()?;
        }
        Ok(out)
    }
}
