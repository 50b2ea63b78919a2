use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use pageview_core::{PixelRect, Selection, ViewerOptions};
use pageview_render::SyntheticProvider;
use pageview_viewer::{PageMount, PointerInput, SelectionMode, Viewer, ViewerEvent};

#[cfg(feature = "pdf")]
use pageview_render::PdfiumProvider;

/// Vertical pixels one j/k keypress scrolls by.
const LINE_STEP: f64 = 40.0;

#[derive(Debug, Parser)]
#[command(
    name = "pageview",
    version,
    about = "windowed document viewport with text and area selections"
)]
struct Args {
    /// Path to a PDF file to open
    file: Option<PathBuf>,

    /// Open a synthetic document with this many US-letter pages instead of a file
    #[arg(long)]
    synthetic: Option<usize>,

    /// Scale multiplier applied to intrinsic page sizes
    #[arg(long, default_value_t = 1.2)]
    scale: f64,

    /// Extra pages mounted beyond the visible range in each direction
    #[arg(long, default_value_t = 1)]
    overscan: usize,

    /// Simulated viewport height in pixels
    #[arg(long, default_value_t = 800.0)]
    viewport: f64,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "pageview", "pageview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let options = ViewerOptions {
        scale: args.scale,
        overscan_count: args.overscan,
        ..ViewerOptions::default()
    };
    // Alt-drag starts an area selection, any other drag is a text selection.
    let mut viewer = Viewer::new(options)?.with_area_selection_predicate(|pointer| pointer.alt);

    open_document(&mut viewer, &args).await?;
    viewer.handle_scroll(0.0, args.viewport);
    viewer.drain_events();

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;

    let mut scroll_top = 0.0_f64;
    let mut stored: Vec<Selection> = Vec::new();
    let mut last_selection_json: Option<String> = None;
    let mut dirty = true;

    loop {
        if dirty {
            redraw(
                &mut stdout,
                &mut viewer,
                scroll_top,
                args.viewport,
                last_selection_json.as_deref(),
            )?;
            dirty = false;
        }

        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let max_scroll = (viewer.layout().total_height() - args.viewport).max(0.0);
        match map_key(event::read()?) {
            CliAction::ScrollBy(delta) => {
                scroll_top = (scroll_top + delta).clamp(0.0, max_scroll);
                viewer.handle_scroll(scroll_top, args.viewport);
            }
            CliAction::Top => {
                scroll_top = 0.0;
                viewer.handle_scroll(scroll_top, args.viewport);
            }
            CliAction::Bottom => {
                scroll_top = max_scroll;
                viewer.handle_scroll(scroll_top, args.viewport);
            }
            CliAction::SimulateText => {
                if let Some(page) = first_mounted_page(&viewer) {
                    viewer.handle_text_selection_change(
                        page,
                        vec![PixelRect::new(40.0, 50.0, 300.0, 72.0)],
                        "simulated text selection".to_string(),
                    );
                }
            }
            CliAction::SimulateArea => {
                if let Some(page) = first_mounted_page(&viewer) {
                    viewer.handle_pointer_down(PointerInput {
                        page_number: page,
                        x: 60.0,
                        y: 90.0,
                        alt: true,
                        ctrl: false,
                        shift: false,
                    });
                    viewer.handle_area_gesture_end(page, PixelRect::new(60.0, 90.0, 220.0, 180.0));
                }
            }
            CliAction::Escape => viewer.handle_escape(),
            CliAction::ClearStored => {
                stored.clear();
                viewer.set_selections(Vec::new());
            }
            CliAction::Quit => break,
            CliAction::None => {}
        }

        for event in viewer.drain_events() {
            match event {
                ViewerEvent::TextSelectionChanged(Some(text)) => {
                    let selection = Selection::Text(text);
                    last_selection_json = Some(serde_json::to_string(&selection)?);
                    replace_text_selection(&mut stored, selection);
                    viewer.set_selections(stored.clone());
                }
                ViewerEvent::AreaSelectionChanged(Some(area)) => {
                    let selection = Selection::Area(area);
                    last_selection_json = Some(serde_json::to_string(&selection)?);
                    stored.push(selection);
                    viewer.set_selections(stored.clone());
                }
                ViewerEvent::TextSelectionChanged(None)
                | ViewerEvent::AreaSelectionChanged(None) => {}
                ViewerEvent::VisiblePagesChanged(pages) => {
                    info!(?pages, "mounted window moved");
                }
                ViewerEvent::DocumentLoaded { document, page_count } => {
                    info!(%document, page_count, "document loaded");
                }
            }
        }
        dirty = true;
    }

    {
        crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }

    // Hand the collected selections to whoever is piping us.
    if !stored.is_empty() {
        drop(_raw);
        let mut out = io::stdout();
        for selection in &stored {
            writeln!(out, "{}", serde_json::to_string(selection)?)?;
        }
    }

    Ok(())
}

async fn open_document(viewer: &mut Viewer, args: &Args) -> Result<()> {
    if let Some(pages) = args.synthetic {
        let provider = SyntheticProvider::letter(pages);
        return viewer.load(&provider, "synthetic").await;
    }

    let Some(path) = &args.file else {
        bail!("provide a PDF file or --synthetic N");
    };
    load_pdf(viewer, path).await
}

#[cfg(feature = "pdf")]
async fn load_pdf(viewer: &mut Viewer, path: &PathBuf) -> Result<()> {
    let provider = PdfiumProvider::new()
        .context("no pdfium library available; try --synthetic to run without one")?;
    let source = path.to_string_lossy();
    viewer
        .load(&provider, source.as_ref())
        .await
        .with_context(|| format!("failed to open {:?}", path))
}

#[cfg(not(feature = "pdf"))]
async fn load_pdf(_viewer: &mut Viewer, _path: &PathBuf) -> Result<()> {
    bail!("built without PDF support; use --synthetic N")
}

/// Keeps at most one in-flight text selection in the stored list; every
/// selection-change replaces it, matching how a live drag updates.
fn replace_text_selection(stored: &mut Vec<Selection>, selection: Selection) {
    if let Some(existing) = stored
        .iter_mut()
        .find(|existing| matches!(existing, Selection::Text(_)))
    {
        *existing = selection;
    } else {
        stored.push(selection);
    }
}

fn first_mounted_page(viewer: &Viewer) -> Option<usize> {
    viewer.visible_pages().first().map(|index| index + 1)
}

enum CliAction {
    ScrollBy(f64),
    Top,
    Bottom,
    SimulateText,
    SimulateArea,
    Escape,
    ClearStored,
    Quit,
    None,
}

fn map_key(event: Event) -> CliAction {
    let Event::Key(KeyEvent { code, kind, .. }) = event else {
        return CliAction::None;
    };
    if kind != KeyEventKind::Press {
        return CliAction::None;
    }
    match code {
        KeyCode::Char('j') | KeyCode::Down => CliAction::ScrollBy(LINE_STEP),
        KeyCode::Char('k') | KeyCode::Up => CliAction::ScrollBy(-LINE_STEP),
        KeyCode::PageDown | KeyCode::Char('d') => CliAction::ScrollBy(LINE_STEP * 10.0),
        KeyCode::PageUp | KeyCode::Char('u') => CliAction::ScrollBy(-LINE_STEP * 10.0),
        KeyCode::Char('g') | KeyCode::Home => CliAction::Top,
        KeyCode::Char('G') | KeyCode::End => CliAction::Bottom,
        KeyCode::Char('t') => CliAction::SimulateText,
        KeyCode::Char('a') => CliAction::SimulateArea,
        KeyCode::Char('c') => CliAction::ClearStored,
        KeyCode::Esc => CliAction::Escape,
        KeyCode::Char('q') => CliAction::Quit,
        _ => CliAction::None,
    }
}

fn redraw(
    stdout: &mut io::Stdout,
    viewer: &mut Viewer,
    scroll_top: f64,
    viewport_height: f64,
    last_selection_json: Option<&str>,
) -> Result<()> {
    let (columns, _) = terminal::size()?;
    let width = usize::from(columns).max(20);

    let plan = viewer.mount_plan();
    let strip = render_strip(&plan, width);
    let status = render_status(viewer, &plan, scroll_top, viewport_height);
    let selection_line = match last_selection_json {
        Some(json) => truncate(format!("last selection: {}", json), width),
        None => "last selection: none".to_string(),
    };

    crossterm::execute!(
        stdout,
        Clear(ClearType::All),
        cursor::MoveTo(0, 0),
        Print("j/k scroll  d/u jump  g/G ends  t text-select  a area-select  Esc clear  q quit"),
        cursor::MoveTo(0, 2),
        Print(strip),
        cursor::MoveTo(0, 3),
        Print(status),
        cursor::MoveTo(0, 4),
        Print(selection_line),
    )?;
    stdout.flush()?;
    Ok(())
}

/// One character per page: '#' for a mounted page, '.' for a placeholder.
fn render_strip(plan: &[PageMount], width: usize) -> String {
    let mut strip = String::with_capacity(plan.len());
    for mount in plan {
        strip.push(match mount {
            PageMount::Live { .. } => '#',
            PageMount::Placeholder { .. } => '.',
        });
    }
    truncate(strip, width)
}

fn render_status(
    viewer: &Viewer,
    plan: &[PageMount],
    scroll_top: f64,
    viewport_height: f64,
) -> String {
    let mounted: Vec<usize> = plan
        .iter()
        .filter_map(|mount| match mount {
            PageMount::Live { page_number, .. } => Some(*page_number),
            PageMount::Placeholder { .. } => None,
        })
        .collect();
    let window = match (mounted.first(), mounted.last()) {
        (Some(first), Some(last)) => format!("pages {}-{}/{}", first, last, plan.len()),
        _ => format!("pages -/{}", plan.len()),
    };
    let mode = match viewer.selection_mode() {
        SelectionMode::Idle => "idle".to_string(),
        SelectionMode::TextSelecting => "text".to_string(),
        SelectionMode::AreaSelecting(page) => format!("area@{}", page),
    };
    format!(
        "{} mounted | scroll {:.0}/{:.0} (viewport {:.0}) | mode {} | selections {}",
        window,
        scroll_top,
        viewer.layout().total_height(),
        viewport_height,
        mode,
        viewer.selections().len(),
    )
}

fn truncate(mut text: String, width: usize) -> String {
    if text.chars().count() > width {
        text = text.chars().take(width.saturating_sub(1)).collect();
        text.push('…');
    }
    text
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pageview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Raw-mode UI owns the terminal, so logs go to the file only.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholder(page_number: usize) -> PageMount {
        PageMount::Placeholder {
            page_number,
            width: 612.0,
            height: 792.0,
        }
    }

    #[tokio::test]
    async fn strip_marks_mounted_pages() {
        let options = ViewerOptions {
            scale: 1.0,
            overscan_count: 0,
            ..ViewerOptions::default()
        };
        let mut viewer = Viewer::new(options).unwrap();
        let provider = SyntheticProvider::new(
            4,
            pageview_core::PageSize {
                width: 100.0,
                height: 100.0,
            },
        );
        viewer.load(&provider, "synthetic").await.unwrap();
        viewer.handle_scroll(150.0, 100.0);

        assert_eq!(render_strip(&viewer.mount_plan(), 80), ".##.");
    }

    #[test]
    fn strip_truncates_to_terminal_width() {
        let plan: Vec<PageMount> = (1..=50).map(placeholder).collect();
        let strip = render_strip(&plan, 20);
        assert_eq!(strip.chars().count(), 20);
        assert!(strip.ends_with('…'));
    }

    #[test]
    fn text_selection_is_replaced_not_accumulated() {
        let position = pageview_core::NormalizedPosition {
            page_number: 1,
            bounding_rect: pageview_core::NormalizedRect {
                x1: 0.1,
                y1: 0.1,
                x2: 0.2,
                y2: 0.2,
            },
            rects: Vec::new(),
        };
        let mut stored = Vec::new();
        for text in ["a", "ab", "abc"] {
            replace_text_selection(
                &mut stored,
                Selection::Text(pageview_core::TextSelection {
                    position: position.clone(),
                    text: text.to_string(),
                }),
            );
        }
        assert_eq!(stored.len(), 1);
        let Selection::Text(kept) = &stored[0] else {
            panic!("expected a text selection");
        };
        assert_eq!(kept.text, "abc");
    }
}
