//! Bridge between a [`ReplicatedText`] and an editable surface.
//!
//! Keystrokes enter through [`EditorBinding::insert`] and
//! [`EditorBinding::delete`]. Every committed model change is pushed to the
//! surface as a minimal [`TextEdit`] computed against what the surface
//! currently shows, so the binding's own edits produce no surface traffic.
//! The surface's read-only flag follows the [`PermissionGate`].

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lectern_core::{PermissionGate, ReplicatedText, Subscription};

/// A single replace operation, in character offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub position: u32,
    pub delete: u32,
    pub insert: String,
}

impl TextEdit {
    /// Minimal edit turning `old` into `new`, or `None` when they match.
    pub fn between(old: &str, new: &str) -> Option<TextEdit> {
        if old == new {
            return None;
        }
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();

        let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        Some(TextEdit {
            position: prefix as u32,
            delete: (old.len() - prefix - suffix) as u32,
            insert: new[prefix..new.len() - suffix].iter().collect(),
        })
    }

    /// Apply to `text`, clamping out-of-range offsets.
    pub fn apply_to(&self, text: &str) -> String {
        let chars: Vec<char> = text.chars().collect();
        let start = (self.position as usize).min(chars.len());
        let end = start.saturating_add(self.delete as usize).min(chars.len());

        let mut out: String = chars[..start].iter().collect();
        out.push_str(&self.insert);
        out.extend(&chars[end..]);
        out
    }
}

/// An editable widget the binding drives.
pub trait EditorSurface: Send + Sync {
    fn content(&self) -> String;
    /// Apply a change that originated in the model, not from the user.
    fn apply_remote_edit(&self, edit: &TextEdit);
    fn set_read_only(&self, read_only: bool);
}

/// In-memory surface. Useful for headless participants and tests.
#[derive(Debug, Default)]
pub struct BufferSurface {
    buffer: Mutex<String>,
    read_only: AtomicBool,
    remote_edits: Mutex<Vec<TextEdit>>,
}

impl BufferSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: impl Into<String>) -> Self {
        Self {
            buffer: Mutex::new(content.into()),
            ..Self::default()
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Every edit pushed by the binding, oldest first.
    pub fn remote_edits(&self) -> Vec<TextEdit> {
        self.remote_edits.lock().clone()
    }

    /// Simulate a user keystroke landing on the widget itself.
    pub fn type_at(&self, position: u32, chunk: &str) {
        let edit = TextEdit {
            position,
            delete: 0,
            insert: chunk.to_string(),
        };
        let mut buffer = self.buffer.lock();
        *buffer = edit.apply_to(&buffer);
    }
}

impl EditorSurface for BufferSurface {
    fn content(&self) -> String {
        self.buffer.lock().clone()
    }

    fn apply_remote_edit(&self, edit: &TextEdit) {
        {
            let mut buffer = self.buffer.lock();
            *buffer = edit.apply_to(&buffer);
        }
        self.remote_edits.lock().push(edit.clone());
    }

    fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }
}

struct ActiveBinding {
    surface: Arc<dyn EditorSurface>,
    _model: Subscription,
    _gate: Subscription,
}

struct BindingShared {
    text: Arc<ReplicatedText>,
    gate: Arc<PermissionGate>,
    active: Mutex<Option<ActiveBinding>>,
    /// Set while the surface is being updated from the model.
    applying_remote: AtomicBool,
}

impl BindingShared {
    fn surface(&self) -> Option<Arc<dyn EditorSurface>> {
        self.active.lock().as_ref().map(|a| a.surface.clone())
    }

    fn refresh_surface(&self) {
        let Some(surface) = self.surface() else {
            return;
        };
        self.push_model_to(surface.as_ref());
    }

    fn push_model_to(&self, surface: &dyn EditorSurface) {
        let Some(edit) = TextEdit::between(&surface.content(), &self.text.content()) else {
            return;
        };
        self.applying_remote.store(true, Ordering::Release);
        surface.apply_remote_edit(&edit);
        self.applying_remote.store(false, Ordering::Release);
    }

    fn accepts_input(&self) -> bool {
        if self.applying_remote.load(Ordering::Acquire) {
            return false;
        }
        if !self.gate.can_edit() {
            log::debug!("{}: read-only, input refused", self.text.key());
            // Undo whatever the widget already shows.
            self.refresh_surface();
            return false;
        }
        true
    }
}

/// At most one surface is bound at a time; dropping releases it.
pub struct EditorBinding {
    shared: Arc<BindingShared>,
}

impl EditorBinding {
    pub fn new(text: Arc<ReplicatedText>, gate: Arc<PermissionGate>) -> Self {
        Self {
            shared: Arc::new(BindingShared {
                text,
                gate,
                active: Mutex::new(None),
                applying_remote: AtomicBool::new(false),
            }),
        }
    }

    /// Attach `surface`, releasing any previous binding first.
    ///
    /// The surface is brought up to date with the model and its read-only
    /// flag set from the gate before this returns.
    pub fn bind(&self, surface: Arc<dyn EditorSurface>) {
        self.release();
        let shared = &self.shared;

        surface.set_read_only(!shared.gate.can_edit());
        shared.push_model_to(surface.as_ref());

        let weak: Weak<BindingShared> = Arc::downgrade(shared);
        let model = shared.text.observe(move |_| {
            if let Some(shared) = weak.upgrade() {
                shared.refresh_surface();
            }
        });
        let target = Arc::downgrade(&surface);
        let gate = shared.gate.on_change(move |can_edit| {
            if let Some(surface) = target.upgrade() {
                surface.set_read_only(!*can_edit);
            }
        });

        log::debug!(
            "{}: bound surface ({} chars, read-only: {})",
            shared.text.key(),
            shared.text.len(),
            !shared.gate.can_edit()
        );
        *shared.active.lock() = Some(ActiveBinding {
            surface,
            _model: model,
            _gate: gate,
        });
    }

    /// Detach the current surface. No callbacks reach it afterwards.
    pub fn release(&self) {
        let released = self.shared.active.lock().take();
        if released.is_some() {
            log::debug!("{}: released surface", self.shared.text.key());
        }
    }

    pub fn is_bound(&self) -> bool {
        self.shared.active.lock().is_some()
    }

    /// Route a keystroke into the model. Returns `false` when refused.
    pub fn insert(&self, position: u32, chunk: &str) -> bool {
        if !self.shared.accepts_input() {
            return false;
        }
        self.shared.text.insert(position, chunk);
        true
    }

    pub fn delete(&self, position: u32, len: u32) -> bool {
        if !self.shared.accepts_input() {
            return false;
        }
        self.shared.text.delete(position, len);
        true
    }

    /// Fill an empty, editable document. Never clobbers existing content.
    pub fn seed_initial_content(&self, content: &str) -> bool {
        let shared = &self.shared;
        if content.is_empty() || !shared.text.is_empty() || !shared.gate.can_edit() {
            return false;
        }
        log::info!("{}: seeding initial content", shared.text.key());
        shared.text.insert(0, content).is_some()
    }
}

impl Drop for EditorBinding {
    fn drop(&mut self) {
        self.release();
    }
}
