//! Lazy paged listing
//!
//! List endpoints return a page of items plus a `nextLink`. A [`Pager`] walks
//! those links one explicit `next_page` call at a time. An empty page with a
//! link is not the end; only a missing link is.

use std::sync::Arc;

use async_trait::async_trait;

use kestrel_common::Result;

/// One page of results
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_link: Option<String>,
}

/// Fetches a page given the previous page's link (`None` for the first page)
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch(&self, link: Option<&str>) -> Result<Page<T>>;
}

/// A restartable sequence of pages
pub struct Pager<T> {
    source: Arc<dyn PageSource<T>>,
    next_link: Option<String>,
    started: bool,
}

impl<T: Send + 'static> Pager<T> {
    pub fn new(source: Arc<dyn PageSource<T>>) -> Self {
        Self {
            source,
            next_link: None,
            started: false,
        }
    }

    /// A pager over pages already in memory
    pub fn from_pages(pages: Vec<Vec<T>>) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(Arc::new(StaticPages { pages }))
    }

    /// Whether another page may be fetched
    pub fn not_done(&self) -> bool {
        !self.started || self.next_link.is_some()
    }

    /// Fetch the next page; `Ok(None)` once every page has been read
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        if !self.not_done() {
            return Ok(None);
        }
        let page = self.source.fetch(self.next_link.as_deref()).await?;
        self.started = true;
        self.next_link = page.next_link.filter(|link| !link.is_empty());
        Ok(Some(page.items))
    }

    /// Start again from the first page
    pub fn restart(&mut self) {
        self.started = false;
        self.next_link = None;
    }

    /// Read every remaining page
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(page) = self.next_page().await? {
            items.extend(page);
        }
        Ok(items)
    }
}

impl<T> std::fmt::Debug for Pager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("next_link", &self.next_link)
            .field("started", &self.started)
            .finish()
    }
}

/// In-memory pages linked by their index
struct StaticPages<T> {
    pages: Vec<Vec<T>>,
}

#[async_trait]
impl<T: Clone + Send + Sync> PageSource<T> for StaticPages<T> {
    async fn fetch(&self, link: Option<&str>) -> Result<Page<T>> {
        let index = link.and_then(|l| l.parse::<usize>().ok()).unwrap_or(0);
        let items = self.pages.get(index).cloned().unwrap_or_default();
        let next_link = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(Page { items, next_link })
    }
}
