//! Shape log position tracking

use std::fmt;

/// Position within a shape log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeOffset {
    /// Full snapshot, then changes
    Initial,
    /// Only changes from the moment of the request
    Now,
    /// Opaque offset returned by the server
    At(String),
}

impl ShapeOffset {
    pub fn as_str(&self) -> &str {
        match self {
            ShapeOffset::Initial => "-1",
            ShapeOffset::Now => "now",
            ShapeOffset::At(offset) => offset,
        }
    }
}

impl fmt::Display for ShapeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request cursor for one subscription: shape handle, offset and live mode
#[derive(Debug, Clone)]
pub struct ShapeCursor {
    start_from_now: bool,
    handle: Option<String>,
    offset: ShapeOffset,
    cache_cursor: Option<String>,
    live: bool,
}

impl ShapeCursor {
    pub fn new(start_from_now: bool) -> Self {
        Self {
            start_from_now,
            handle: None,
            offset: Self::initial_offset(start_from_now),
            cache_cursor: None,
            live: false,
        }
    }

    fn initial_offset(start_from_now: bool) -> ShapeOffset {
        if start_from_now {
            ShapeOffset::Now
        } else {
            ShapeOffset::Initial
        }
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn offset(&self) -> &ShapeOffset {
        &self.offset
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Apply the position headers of a successful response
    pub fn advance(
        &mut self,
        handle: Option<String>,
        offset: Option<String>,
        cache_cursor: Option<String>,
    ) {
        if let Some(handle) = handle {
            self.handle = Some(handle);
        }
        if let Some(offset) = offset {
            self.offset = ShapeOffset::At(offset);
        }
        if cache_cursor.is_some() {
            self.cache_cursor = cache_cursor;
        }
    }

    /// The client has caught up; switch to long-polling
    pub fn mark_up_to_date(&mut self) {
        self.live = true;
    }

    /// Drop the shape handle and start over from the initial offset
    pub fn reset(&mut self) {
        *self = Self::new(self.start_from_now);
    }

    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("offset", self.offset.to_string())];
        if let Some(handle) = &self.handle {
            params.push(("handle", handle.clone()));
        }
        if self.live {
            params.push(("live", "true".to_string()));
            if let Some(cursor) = &self.cache_cursor {
                params.push(("cursor", cursor.clone()));
            }
        }
        params
    }
}
