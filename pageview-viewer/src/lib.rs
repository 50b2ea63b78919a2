use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use pageview_core::{
    new_document_id, normalize_rects, AreaSelection, DocumentId, DocumentProvider, OptionsError,
    PageGeometry, PageLayout, PixelRect, Selection, TextSelection, ViewerOptions,
};

/// Which interaction owns the pointer right now. Exactly one is active at a
/// time; the arbiter below enforces the exclusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Idle,
    TextSelecting,
    /// An area drag is in progress on the given 1-based page.
    AreaSelecting(usize),
}

/// Ordered side effects produced by an arbiter transition. Order matters: an
/// area selection must observe the text selection being cleared before any of
/// its own effects commit.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionSignal {
    TextCleared,
    AreaCleared,
    Text(TextSelection),
    Area(AreaSelection),
}

/// State machine arbitrating between native text selection and rectangular
/// area selection. While an area drag is active, text selection is disabled
/// at the container level so the drag cannot simultaneously start a native
/// text gesture.
#[derive(Debug)]
pub struct SelectionArbiter {
    mode: SelectionMode,
    text_selection_enabled: bool,
}

impl Default for SelectionArbiter {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Idle,
            text_selection_enabled: true,
        }
    }
}

impl SelectionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Mirrors the container-level "selectable" flag: false for as long as an
    /// area drag is in progress.
    pub fn text_selection_enabled(&self) -> bool {
        self.text_selection_enabled
    }

    /// Enters area-selection mode for a page. Any in-progress text selection
    /// is cleared first.
    pub fn begin_area_selection(&mut self, page_number: usize) -> Vec<SelectionSignal> {
        let mut signals = Vec::new();
        signals.push(SelectionSignal::TextCleared);
        self.text_selection_enabled = false;
        self.mode = SelectionMode::AreaSelecting(page_number);
        signals
    }

    /// Leaves area-selection mode, re-enabling text selection. `None` means
    /// the drag completed without producing a usable rectangle.
    pub fn end_area_selection(&mut self, selection: Option<AreaSelection>) -> Vec<SelectionSignal> {
        self.mode = SelectionMode::Idle;
        self.text_selection_enabled = true;
        match selection {
            Some(selection) => vec![SelectionSignal::Area(selection)],
            None => vec![SelectionSignal::AreaCleared],
        }
    }

    /// Reports a non-collapsed text range. Ignored while text selection is
    /// disabled by an active area drag.
    pub fn text_selection_changed(&mut self, selection: TextSelection) -> Vec<SelectionSignal> {
        if !self.text_selection_enabled {
            return Vec::new();
        }
        self.mode = SelectionMode::TextSelecting;
        vec![SelectionSignal::Text(selection)]
    }

    /// Escape, or a fresh pointer-down anywhere: back to idle, clearing both
    /// selection kinds regardless of which one was active.
    pub fn reset(&mut self) -> Vec<SelectionSignal> {
        self.mode = SelectionMode::Idle;
        self.text_selection_enabled = true;
        vec![SelectionSignal::TextCleared, SelectionSignal::AreaCleared]
    }
}

/// Outcomes the viewer reports to its caller. Selection payloads are
/// `Option`s: `None` means the corresponding selection kind was cleared.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    DocumentLoaded {
        document: DocumentId,
        page_count: usize,
    },
    VisiblePagesChanged(Vec<usize>),
    TextSelectionChanged(Option<TextSelection>),
    AreaSelectionChanged(Option<AreaSelection>),
}

/// A pointer-down as seen by a mounted page, with the modifier state the
/// area-selection predicate typically keys off.
#[derive(Debug, Clone, Copy)]
pub struct PointerInput {
    /// 1-based page the pointer went down on.
    pub page_number: usize,
    pub x: f64,
    pub y: f64,
    pub alt: bool,
    pub ctrl: bool,
    pub shift: bool,
}

pub type AreaSelectionPredicate = Box<dyn Fn(&PointerInput) -> bool + Send + Sync>;

/// Opaque identity for a mounted page, stable while the current document is
/// loaded. Presentation layers key DOM nodes / widgets off this so a page
/// keeps its identity across re-renders within one visibility period, and
/// gets a fresh one after a document change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageHandle(u64);

/// Per-page render instruction: a live page inside the mounted window, or a
/// placeholder that only reserves the exact same layout space.
#[derive(Debug, Clone, PartialEq)]
pub enum PageMount {
    Live {
        page_number: usize,
        geometry: PageGeometry,
        handle: PageHandle,
        area_selection_active: bool,
        selection_count: usize,
    },
    Placeholder {
        page_number: usize,
        width: f64,
        height: f64,
    },
}

/// Cancels all future viewer side effects when the embedding surface is torn
/// down. After `cancel()`, in-flight load completions are discarded and event
/// handlers become no-ops.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The viewer orchestrator: owns page geometry and the mounted window, wires
/// scroll/pointer/selection inputs through the arbiter and normalizer, and
/// reports outcomes through a drained event queue.
pub struct Viewer {
    options: ViewerOptions,
    arbiter: SelectionArbiter,
    layout: PageLayout,
    document_id: Option<DocumentId>,
    visible: Vec<usize>,
    scroll_top: f64,
    viewport_height: f64,
    selections: Vec<Selection>,
    selection_buckets: HashMap<usize, Vec<Selection>>,
    page_handles: HashMap<usize, PageHandle>,
    next_handle: u64,
    generation: u64,
    alive: Arc<AtomicBool>,
    events: Arc<Mutex<Vec<ViewerEvent>>>,
    area_predicate: Option<AreaSelectionPredicate>,
}

impl Viewer {
    pub fn new(options: ViewerOptions) -> Result<Self, OptionsError> {
        let options = options.validated()?;
        Ok(Self {
            options,
            arbiter: SelectionArbiter::new(),
            layout: PageLayout::empty(),
            document_id: None,
            visible: Vec::new(),
            scroll_top: 0.0,
            viewport_height: 0.0,
            selections: Vec::new(),
            selection_buckets: HashMap::new(),
            page_handles: HashMap::new(),
            next_handle: 0,
            generation: 0,
            alive: Arc::new(AtomicBool::new(true)),
            events: Arc::new(Mutex::new(Vec::new())),
            area_predicate: None,
        })
    }

    /// Installs the predicate deciding, per pointer-down, whether the gesture
    /// starts an area selection. Without one, area selection stays disabled
    /// and every drag is a native text selection.
    pub fn with_area_selection_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PointerInput) -> bool + Send + Sync + 'static,
    {
        self.area_predicate = Some(Box::new(predicate));
        self
    }

    pub fn options(&self) -> &ViewerOptions {
        &self.options
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.document_id
    }

    pub fn page_count(&self) -> usize {
        self.layout.page_count()
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    pub fn selection_mode(&self) -> SelectionMode {
        self.arbiter.mode()
    }

    pub fn text_selection_enabled(&self) -> bool {
        self.arbiter.text_selection_enabled()
    }

    /// 0-based indices of the currently mounted pages.
    pub fn visible_pages(&self) -> &[usize] {
        &self.visible
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ViewerEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn drain_events(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.alive))
    }

    fn is_live(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Flips the liveness flag. Every handler checks it on entry, so no state
    /// mutates and no event is emitted once the viewer is closed.
    pub fn close(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Loads a document through the external renderer boundary: fetch every
    /// intrinsic page size, build the layout wholesale, assign a fresh
    /// document identity and compute the initial window.
    ///
    /// Starting a load supersedes the previous document immediately. A
    /// completion that arrives after `close()` or after a newer load started
    /// is discarded without touching viewer state. Provider failures
    /// propagate to the caller unchanged; there is no retry.
    #[instrument(skip(self, provider))]
    pub async fn load(&mut self, provider: &dyn DocumentProvider, source: &str) -> Result<()> {
        if !self.is_live() {
            return Ok(());
        }
        self.generation += 1;
        let generation = self.generation;
        self.reset_document_state();

        let backend = provider.open(source).await?;
        if !self.is_live() || generation != self.generation {
            debug!(source, "discarding stale document load");
            return Ok(());
        }

        let page_count = backend.page_count();
        let mut sizes = Vec::with_capacity(page_count);
        for page_number in 1..=page_count {
            sizes.push(backend.page_size(page_number)?);
        }

        let layout = PageLayout::from_page_sizes(&sizes, &self.options)?;
        let document = new_document_id();
        self.layout = layout;
        self.document_id = Some(document);
        self.visible = self.layout.visible_pages(
            self.scroll_top,
            self.viewport_height,
            self.options.overscan_count,
        );

        let mut events = self.events.lock();
        events.push(ViewerEvent::DocumentLoaded {
            document,
            page_count,
        });
        events.push(ViewerEvent::VisiblePagesChanged(self.visible.clone()));
        Ok(())
    }

    fn reset_document_state(&mut self) {
        self.document_id = None;
        self.layout = PageLayout::empty();
        self.visible.clear();
        self.page_handles.clear();
        self.selection_buckets.clear();
    }

    /// Replaces the caller-supplied selection list and rebuilds the per-page
    /// lookup buckets used when rendering mounted pages.
    pub fn set_selections(&mut self, selections: Vec<Selection>) {
        if !self.is_live() {
            return;
        }
        let mut buckets: HashMap<usize, Vec<Selection>> = HashMap::new();
        for selection in &selections {
            buckets
                .entry(selection.page_number())
                .or_default()
                .push(selection.clone());
        }
        self.selections = selections;
        self.selection_buckets = buckets;
    }

    pub fn selections(&self) -> &[Selection] {
        &self.selections
    }

    pub fn selections_for_page(&self, page_number: usize) -> &[Selection] {
        self.selection_buckets
            .get(&page_number)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Recomputes the mounted window for a new scroll position. Cheap enough
    /// to run on every scroll tick; only an actual window move is reported.
    pub fn handle_scroll(&mut self, scroll_top: f64, viewport_height: f64) {
        if !self.is_live() {
            return;
        }
        self.scroll_top = scroll_top;
        self.viewport_height = viewport_height;
        if self.document_id.is_none() {
            return;
        }
        let visible =
            self.layout
                .visible_pages(scroll_top, viewport_height, self.options.overscan_count);
        if visible != self.visible {
            self.visible = visible;
            self.events
                .lock()
                .push(ViewerEvent::VisiblePagesChanged(self.visible.clone()));
        }
    }

    /// A pointer going down anywhere in the viewport. Both selection kinds
    /// are cleared first; if the area-selection predicate accepts the gesture
    /// and the page is mounted, area-selection mode starts on that page.
    pub fn handle_pointer_down(&mut self, pointer: PointerInput) {
        if !self.is_live() {
            return;
        }
        let signals = self.arbiter.reset();
        self.publish(signals);

        let wants_area = self
            .area_predicate
            .as_ref()
            .map(|predicate| predicate(&pointer))
            .unwrap_or(false);
        if !wants_area {
            return;
        }
        if !self.is_page_mounted(pointer.page_number) {
            debug!(
                page = pointer.page_number,
                "ignoring area gesture on unmounted page"
            );
            return;
        }
        let signals = self.arbiter.begin_area_selection(pointer.page_number);
        self.publish(signals);
    }

    /// The drag of an area gesture finished with the given rectangle, in
    /// pixels relative to the page it started on. A degenerate rectangle
    /// degrades to "no selection produced".
    pub fn handle_area_gesture_end(&mut self, page_number: usize, rect: PixelRect) {
        if !self.is_live() {
            return;
        }
        if self.arbiter.mode() != SelectionMode::AreaSelecting(page_number) {
            return;
        }
        let Some(geometry) = self.layout.geometry(page_number).copied() else {
            let signals = self.arbiter.end_area_selection(None);
            self.publish(signals);
            return;
        };
        let signals = match normalize_rects(page_number, &[rect], geometry.width, geometry.height)
        {
            Ok(position) => self
                .arbiter
                .end_area_selection(Some(AreaSelection { position })),
            Err(err) => {
                debug!(%err, page = page_number, "discarding malformed area selection");
                self.arbiter.end_area_selection(None)
            }
        };
        self.publish(signals);
    }

    /// A selection-change fired with a non-collapsed range on a page: the
    /// range's client rectangles plus its extracted text. Ignored while an
    /// area drag has text selection disabled, and for unmounted pages.
    pub fn handle_text_selection_change(
        &mut self,
        page_number: usize,
        rects: Vec<PixelRect>,
        text: String,
    ) {
        if !self.is_live() || !self.arbiter.text_selection_enabled() {
            return;
        }
        if !self.is_page_mounted(page_number) {
            return;
        }
        let Some(geometry) = self.layout.geometry(page_number).copied() else {
            return;
        };
        match normalize_rects(page_number, &rects, geometry.width, geometry.height) {
            Ok(position) => {
                let signals = self
                    .arbiter
                    .text_selection_changed(TextSelection { position, text });
                self.publish(signals);
            }
            // Collapsed or empty ranges simply never become selections.
            Err(err) => debug!(%err, page = page_number, "skipping degenerate text range"),
        }
    }

    /// Escape clears both selection kinds from any state.
    pub fn handle_escape(&mut self) {
        if !self.is_live() {
            return;
        }
        let signals = self.arbiter.reset();
        self.publish(signals);
    }

    /// One render instruction per page: live pages (with stable handles)
    /// inside the mounted window, geometry-sized placeholders outside it.
    pub fn mount_plan(&mut self) -> Vec<PageMount> {
        if self.document_id.is_none() {
            return Vec::new();
        }
        let area_page = match self.arbiter.mode() {
            SelectionMode::AreaSelecting(page) => Some(page),
            _ => None,
        };
        let geometries: Vec<PageGeometry> = self.layout.geometries().to_vec();
        geometries
            .into_iter()
            .enumerate()
            .map(|(index, geometry)| {
                let page_number = geometry.page_number;
                if self.visible.contains(&index) {
                    PageMount::Live {
                        page_number,
                        geometry,
                        handle: self.page_handle(page_number),
                        area_selection_active: area_page == Some(page_number),
                        selection_count: self.selections_for_page(page_number).len(),
                    }
                } else {
                    PageMount::Placeholder {
                        page_number,
                        width: geometry.width,
                        height: geometry.height,
                    }
                }
            })
            .collect()
    }

    fn page_handle(&mut self, page_number: usize) -> PageHandle {
        if let Some(handle) = self.page_handles.get(&page_number) {
            return *handle;
        }
        self.next_handle += 1;
        let handle = PageHandle(self.next_handle);
        self.page_handles.insert(page_number, handle);
        handle
    }

    fn is_page_mounted(&self, page_number: usize) -> bool {
        page_number
            .checked_sub(1)
            .map(|index| self.visible.contains(&index))
            .unwrap_or(false)
    }

    fn publish(&self, signals: Vec<SelectionSignal>) {
        if signals.is_empty() || !self.is_live() {
            return;
        }
        let mut events = self.events.lock();
        for signal in signals {
            events.push(match signal {
                SelectionSignal::TextCleared => ViewerEvent::TextSelectionChanged(None),
                SelectionSignal::AreaCleared => ViewerEvent::AreaSelectionChanged(None),
                SelectionSignal::Text(selection) => {
                    ViewerEvent::TextSelectionChanged(Some(selection))
                }
                SelectionSignal::Area(selection) => {
                    ViewerEvent::AreaSelectionChanged(Some(selection))
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pageview_core::{DocumentBackend, NormalizedPosition, NormalizedRect, PageSize};
    use pageview_render::SyntheticProvider;

    fn test_options() -> ViewerOptions {
        ViewerOptions {
            scale: 1.0,
            border_offset: 11.0,
            overscan_count: 1,
            text_selection_color: None,
        }
    }

    async fn loaded_viewer(pages: usize) -> Viewer {
        let mut viewer = Viewer::new(test_options())
            .unwrap()
            .with_area_selection_predicate(|pointer| pointer.alt);
        let provider = SyntheticProvider::new(
            pages,
            PageSize {
                width: 100.0,
                height: 100.0,
            },
        );
        viewer.load(&provider, "synthetic").await.unwrap();
        viewer.handle_scroll(0.0, 100.0);
        viewer.drain_events();
        viewer
    }

    fn pointer_on(page_number: usize, alt: bool) -> PointerInput {
        PointerInput {
            page_number,
            x: 10.0,
            y: 10.0,
            alt,
            ctrl: false,
            shift: false,
        }
    }

    fn sample_rect() -> PixelRect {
        PixelRect::new(10.0, 10.0, 40.0, 30.0)
    }

    #[test]
    fn arbiter_area_start_clears_text_first() {
        let mut arbiter = SelectionArbiter::new();
        let signals = arbiter.begin_area_selection(4);
        assert_eq!(signals, vec![SelectionSignal::TextCleared]);
        assert_eq!(arbiter.mode(), SelectionMode::AreaSelecting(4));
        assert!(!arbiter.text_selection_enabled());
    }

    #[test]
    fn arbiter_reset_clears_both_kinds_from_any_state() {
        let mut arbiter = SelectionArbiter::new();
        arbiter.begin_area_selection(2);
        let signals = arbiter.reset();
        assert_eq!(
            signals,
            vec![SelectionSignal::TextCleared, SelectionSignal::AreaCleared]
        );
        assert_eq!(arbiter.mode(), SelectionMode::Idle);
        assert!(arbiter.text_selection_enabled());
    }

    #[test]
    fn arbiter_ignores_text_changes_while_area_drag_is_active() {
        let mut arbiter = SelectionArbiter::new();
        arbiter.begin_area_selection(1);
        let selection = TextSelection {
            position: NormalizedPosition {
                page_number: 1,
                bounding_rect: NormalizedRect {
                    x1: 0.0,
                    y1: 0.0,
                    x2: 0.5,
                    y2: 0.5,
                },
                rects: Vec::new(),
            },
            text: "hello".into(),
        };
        assert!(arbiter.text_selection_changed(selection).is_empty());
        assert_eq!(arbiter.mode(), SelectionMode::AreaSelecting(1));
    }

    #[tokio::test]
    async fn load_builds_layout_and_initial_window() {
        let mut viewer = Viewer::new(test_options()).unwrap();
        viewer.handle_scroll(0.0, 100.0);
        let provider = SyntheticProvider::new(
            10,
            PageSize {
                width: 100.0,
                height: 100.0,
            },
        );
        viewer.load(&provider, "synthetic").await.unwrap();

        assert_eq!(viewer.page_count(), 10);
        assert!(viewer.document_id().is_some());
        assert_eq!(viewer.visible_pages(), &[0, 1]);

        let events = viewer.drain_events();
        assert!(matches!(
            events[0],
            ViewerEvent::DocumentLoaded { page_count: 10, .. }
        ));
        assert_eq!(events[1], ViewerEvent::VisiblePagesChanged(vec![0, 1]));
    }

    #[tokio::test]
    async fn scroll_moves_the_window_and_reports_only_changes() {
        let mut viewer = loaded_viewer(10).await;

        viewer.handle_scroll(0.0, 100.0);
        assert!(viewer.drain_events().is_empty());

        viewer.handle_scroll(500.0, 100.0);
        let events = viewer.drain_events();
        assert_eq!(events.len(), 1);
        let ViewerEvent::VisiblePagesChanged(pages) = &events[0] else {
            panic!("unexpected event: {:?}", events[0]);
        };
        assert_eq!(pages, viewer.visible_pages());
        for pair in pages.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[tokio::test]
    async fn area_start_clears_text_selection_before_area_effects() {
        let mut viewer = loaded_viewer(10).await;

        viewer.handle_text_selection_change(1, vec![sample_rect()], "quoted text".into());
        let events = viewer.drain_events();
        assert!(matches!(
            events.as_slice(),
            [ViewerEvent::TextSelectionChanged(Some(_))]
        ));

        viewer.handle_pointer_down(pointer_on(1, true));
        assert_eq!(viewer.selection_mode(), SelectionMode::AreaSelecting(1));
        assert!(!viewer.text_selection_enabled());

        let events = viewer.drain_events();
        let text_cleared_at = events
            .iter()
            .position(|event| matches!(event, ViewerEvent::TextSelectionChanged(None)))
            .expect("text selection must be cleared");
        let area_events_after = events
            .iter()
            .skip(text_cleared_at)
            .all(|event| !matches!(event, ViewerEvent::AreaSelectionChanged(Some(_))));
        assert!(area_events_after);

        viewer.handle_area_gesture_end(1, sample_rect());
        let events = viewer.drain_events();
        assert!(matches!(
            events.as_slice(),
            [ViewerEvent::AreaSelectionChanged(Some(_))]
        ));
        assert_eq!(viewer.selection_mode(), SelectionMode::Idle);
        assert!(viewer.text_selection_enabled());
    }

    #[tokio::test]
    async fn escape_clears_both_selection_kinds() {
        let mut viewer = loaded_viewer(10).await;
        viewer.handle_pointer_down(pointer_on(1, true));
        viewer.drain_events();

        viewer.handle_escape();
        let events = viewer.drain_events();
        assert!(events.contains(&ViewerEvent::TextSelectionChanged(None)));
        assert!(events.contains(&ViewerEvent::AreaSelectionChanged(None)));
        assert_eq!(viewer.selection_mode(), SelectionMode::Idle);
        assert!(viewer.text_selection_enabled());
    }

    #[tokio::test]
    async fn degenerate_area_gesture_produces_no_selection() {
        let mut viewer = loaded_viewer(10).await;
        viewer.handle_pointer_down(pointer_on(1, true));
        viewer.drain_events();

        viewer.handle_area_gesture_end(1, PixelRect::new(25.0, 30.0, 25.0, 80.0));
        let events = viewer.drain_events();
        assert_eq!(events, vec![ViewerEvent::AreaSelectionChanged(None)]);
        assert_eq!(viewer.selection_mode(), SelectionMode::Idle);
        assert!(viewer.text_selection_enabled());
    }

    #[tokio::test]
    async fn degenerate_text_range_is_skipped_silently() {
        let mut viewer = loaded_viewer(10).await;

        viewer.handle_text_selection_change(1, Vec::new(), String::new());
        viewer.handle_text_selection_change(
            1,
            vec![PixelRect::new(0.0, 0.0, 0.0, 5.0)],
            String::new(),
        );
        assert!(viewer.drain_events().is_empty());
        assert_eq!(viewer.selection_mode(), SelectionMode::Idle);
    }

    #[tokio::test]
    async fn text_changes_are_ignored_while_area_drag_is_active() {
        let mut viewer = loaded_viewer(10).await;
        viewer.handle_pointer_down(pointer_on(1, true));
        viewer.drain_events();

        viewer.handle_text_selection_change(1, vec![sample_rect()], "ignored".into());
        assert!(viewer.drain_events().is_empty());
        assert_eq!(viewer.selection_mode(), SelectionMode::AreaSelecting(1));
    }

    #[tokio::test]
    async fn selections_on_unmounted_pages_are_not_computed() {
        let mut viewer = loaded_viewer(20).await;
        assert_eq!(viewer.visible_pages(), &[0, 1]);

        viewer.handle_text_selection_change(15, vec![sample_rect()], "off screen".into());
        assert!(viewer.drain_events().is_empty());

        viewer.handle_pointer_down(pointer_on(15, true));
        assert_eq!(viewer.selection_mode(), SelectionMode::Idle);
    }

    #[tokio::test]
    async fn set_selections_buckets_by_page() {
        let mut viewer = loaded_viewer(10).await;

        viewer.handle_text_selection_change(1, vec![sample_rect()], "first".into());
        let events = viewer.drain_events();
        let ViewerEvent::TextSelectionChanged(Some(text)) = &events[0] else {
            panic!("unexpected event: {:?}", events[0]);
        };

        let selections = vec![
            Selection::Text(text.clone()),
            Selection::Area(AreaSelection {
                position: NormalizedPosition {
                    page_number: 2,
                    bounding_rect: text.position.bounding_rect,
                    rects: text.position.rects.clone(),
                },
            }),
        ];
        viewer.set_selections(selections);

        assert_eq!(viewer.selections_for_page(1).len(), 1);
        assert_eq!(viewer.selections_for_page(2).len(), 1);
        assert!(viewer.selections_for_page(3).is_empty());
    }

    #[tokio::test]
    async fn mount_plan_mixes_live_pages_and_sized_placeholders() {
        let mut viewer = loaded_viewer(10).await;

        let plan = viewer.mount_plan();
        assert_eq!(plan.len(), 10);
        assert!(matches!(
            plan[0],
            PageMount::Live {
                page_number: 1,
                ..
            }
        ));
        let PageMount::Placeholder { width, height, .. } = plan[5] else {
            panic!("page 6 should be a placeholder");
        };
        let geometry = viewer.layout().geometry(6).unwrap();
        assert_eq!(width, geometry.width);
        assert_eq!(height, geometry.height);
    }

    #[tokio::test]
    async fn page_handles_are_stable_within_a_document_and_reset_across_loads() {
        let mut viewer = loaded_viewer(10).await;
        let first_id = viewer.document_id().unwrap();

        let handle_of = |plan: &[PageMount]| match plan[0] {
            PageMount::Live { handle, .. } => handle,
            _ => panic!("page 1 should be live"),
        };

        let before = handle_of(&viewer.mount_plan());
        viewer.handle_scroll(100.0, 100.0);
        assert_eq!(handle_of(&viewer.mount_plan()), before);

        let provider = SyntheticProvider::new(
            10,
            PageSize {
                width: 100.0,
                height: 100.0,
            },
        );
        viewer.load(&provider, "synthetic-2").await.unwrap();
        viewer.handle_scroll(0.0, 100.0);
        assert_ne!(viewer.document_id().unwrap(), first_id);
        assert_ne!(handle_of(&viewer.mount_plan()), before);
    }

    struct CancellingProvider {
        handle: CancelHandle,
        inner: SyntheticProvider,
    }

    #[async_trait::async_trait]
    impl DocumentProvider for CancellingProvider {
        async fn open(&self, source: &str) -> Result<Arc<dyn DocumentBackend>> {
            // Tear the viewer down while the open is still in flight.
            self.handle.cancel();
            self.inner.open(source).await
        }
    }

    #[tokio::test]
    async fn load_completion_after_teardown_is_discarded() {
        let mut viewer = Viewer::new(test_options()).unwrap();
        let provider = CancellingProvider {
            handle: viewer.cancel_handle(),
            inner: SyntheticProvider::new(
                10,
                PageSize {
                    width: 100.0,
                    height: 100.0,
                },
            ),
        };

        viewer.load(&provider, "synthetic").await.unwrap();
        assert_eq!(viewer.page_count(), 0);
        assert!(viewer.document_id().is_none());
        assert!(viewer.drain_events().is_empty());
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl DocumentProvider for FailingProvider {
        async fn open(&self, _source: &str) -> Result<Arc<dyn DocumentBackend>> {
            Err(anyhow::anyhow!("decoder exploded"))
        }
    }

    #[tokio::test]
    async fn provider_failure_propagates_unchanged_and_leaves_viewer_empty() {
        let mut viewer = Viewer::new(test_options()).unwrap();
        let err = viewer.load(&FailingProvider, "/nope.pdf").await.unwrap_err();
        assert_eq!(err.to_string(), "decoder exploded");
        assert_eq!(viewer.page_count(), 0);
        assert!(viewer.mount_plan().is_empty());
    }

    #[tokio::test]
    async fn loading_a_new_document_clears_prior_geometry() {
        let mut viewer = loaded_viewer(10).await;
        assert_eq!(viewer.page_count(), 10);

        let provider = SyntheticProvider::new(
            3,
            PageSize {
                width: 50.0,
                height: 50.0,
            },
        );
        viewer.load(&provider, "smaller").await.unwrap();
        assert_eq!(viewer.page_count(), 3);
        assert_eq!(viewer.layout().offsets().len(), 3);
    }

    #[tokio::test]
    async fn closed_viewer_performs_no_side_effects() {
        let mut viewer = loaded_viewer(10).await;
        let window_before = viewer.visible_pages().to_vec();
        viewer.close();

        viewer.handle_scroll(800.0, 100.0);
        viewer.handle_pointer_down(pointer_on(1, true));
        viewer.handle_text_selection_change(1, vec![sample_rect()], "late".into());
        viewer.handle_escape();

        assert_eq!(viewer.visible_pages(), window_before.as_slice());
        assert_eq!(viewer.selection_mode(), SelectionMode::Idle);
        assert!(viewer.drain_events().is_empty());
    }

    #[test]
    fn invalid_options_are_rejected_at_construction() {
        let options = ViewerOptions {
            scale: 0.0,
            ..ViewerOptions::default()
        };
        assert!(Viewer::new(options).is_err());
    }
}
