//! Long stack traces: each promise remembers where it was created and the trace of
//! the promise it was derived from.
use std::{fmt, panic::Location, rc::Rc};

/// Separator printed between stitched creation sites.
pub const STACK_JUMP_SEPARATOR: &str = "From previous event:";

const MAX_DEPTH: usize = 64;

struct Frame {
    location: &'static Location<'static>,
    depth: usize,
    parent: Option<Rc<Frame>>,
}

/// The stitched creation history of a promise. Empty unless
/// [`Config::long_stack_traces`](crate::Config::long_stack_traces) is set.
#[derive(Clone, Default)]
pub struct Trace {
    frame: Option<Rc<Frame>>,
}

impl Trace {
    pub(crate) fn capture(
        enabled: bool,
        location: &'static Location<'static>,
        parent: Option<&Trace>,
    ) -> Trace {
        if !enabled {
            return Trace::default();
        }
        let parent = parent.and_then(|trace| match &trace.frame {
            Some(frame) if frame.depth >= MAX_DEPTH => newest(frame, MAX_DEPTH - 1),
            frame => frame.clone(),
        });
        let depth = parent.as_ref().map_or(1, |frame| frame.depth + 1);
        Trace {
            frame: Some(Rc::new(Frame {
                location,
                depth,
                parent,
            })),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_none()
    }

    /// Creation sites, most recent first.
    pub fn locations(&self) -> impl Iterator<Item = &'static Location<'static>> + '_ {
        let mut next = self.frame.as_deref();
        std::iter::from_fn(move || {
            let frame = next?;
            next = frame.parent.as_deref();
            Some(frame.location)
        })
    }
}

// Rebuilds the `keep` most recent frames of `frame` as a fresh chain.
fn newest(frame: &Rc<Frame>, keep: usize) -> Option<Rc<Frame>> {
    let mut kept = Vec::with_capacity(keep);
    let mut next = Some(frame);
    while let Some(frame) = next.filter(|_| kept.len() < keep) {
        kept.push(frame.location);
        next = frame.parent.as_ref();
    }
    kept.into_iter().rev().fold(None, |parent: Option<Rc<Frame>>, location| {
        let depth = parent.as_ref().map_or(1, |frame| frame.depth + 1);
        Some(Rc::new(Frame {
            location,
            depth,
            parent,
        }))
    })
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, location) in self.locations().enumerate() {
            if i > 0 {
                writeln!(f)?;
                writeln!(f, "{STACK_JUMP_SEPARATOR}")?;
            }
            write!(f, "    at {location}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.locations()).finish()
    }
}
