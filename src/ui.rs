use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use mdm_resolution::{
    AuditSink, ConflictedMerge, GoldenRecord, PendingReview, ResolutionEngine, ResolutionStore, ReviewConfidence,
    StewardVerdict, Tier,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    ReviewQueue,
    Conflicts,
    GoldenRecords,
}

impl Page {
    pub fn next(&self) -> Self {
        match self {
            Page::ReviewQueue => Page::Conflicts,
            Page::Conflicts => Page::GoldenRecords,
            Page::GoldenRecords => Page::ReviewQueue,
        }
    }

    pub fn previous(&self) -> Self {
        match self {
            Page::ReviewQueue => Page::GoldenRecords,
            Page::Conflicts => Page::ReviewQueue,
            Page::GoldenRecords => Page::Conflicts,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Page::ReviewQueue => "Review Queue",
            Page::Conflicts => "Conflicts",
            Page::GoldenRecords => "Golden Records",
        }
    }
}

pub struct App {
    pub steward: String,
    pub reviews: Vec<PendingReview>,
    pub conflicts: Vec<ConflictedMerge>,
    pub goldens: Vec<GoldenRecord>,
    pub current_page: Page,
    pub review_state: TableState,
    pub conflict_state: TableState,
    pub golden_state: TableState,
    pub show_detail: bool,
    pub message: Option<String>,
}

impl App {
    pub fn new(steward: &str) -> Self {
        Self {
            steward: steward.to_string(),
            reviews: Vec::new(),
            conflicts: Vec::new(),
            goldens: Vec::new(),
            current_page: Page::ReviewQueue,
            review_state: TableState::default(),
            conflict_state: TableState::default(),
            golden_state: TableState::default(),
            show_detail: false,
            message: None,
        }
    }

    /// Reload every page from the engine, keeping selections in range
    pub fn load<S: ResolutionStore, A: AuditSink>(&mut self, engine: &ResolutionEngine<S, A>) -> Result<()> {
        self.reviews = engine.pending_reviews()?;
        // High-confidence first, strongest first within a confidence band
        self.reviews.sort_by(|x, y| {
            confidence_rank(x.confidence)
                .cmp(&confidence_rank(y.confidence))
                .then(y.score.composite.partial_cmp(&x.score.composite).unwrap_or(std::cmp::Ordering::Equal))
                .then(x.pair().cmp(y.pair()))
        });
        self.conflicts = engine.open_conflicts()?;
        self.goldens = engine.current_goldens()?;

        clamp(&mut self.review_state, self.reviews.len());
        clamp(&mut self.conflict_state, self.conflicts.len());
        clamp(&mut self.golden_state, self.goldens.len());
        Ok(())
    }

    pub fn toggle_detail(&mut self) {
        self.show_detail = !self.show_detail;
    }

    pub fn next_page(&mut self) {
        self.current_page = self.current_page.next();
    }

    pub fn previous_page(&mut self) {
        self.current_page = self.current_page.previous();
    }

    fn current(&mut self) -> (&mut TableState, usize) {
        match self.current_page {
            Page::ReviewQueue => (&mut self.review_state, self.reviews.len()),
            Page::Conflicts => (&mut self.conflict_state, self.conflicts.len()),
            Page::GoldenRecords => (&mut self.golden_state, self.goldens.len()),
        }
    }

    pub fn next(&mut self) {
        let (state, len) = self.current();
        if len == 0 {
            return;
        }
        let i = match state.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let (state, len) = self.current();
        if len == 0 {
            return;
        }
        let i = match state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        state.select(Some(i));
    }

    pub fn page_down(&mut self) {
        let (state, len) = self.current();
        if len == 0 {
            return;
        }
        let i = state.selected().map(|i| (i + 20).min(len - 1)).unwrap_or(0);
        state.select(Some(i));
    }

    pub fn page_up(&mut self) {
        let (state, _) = self.current();
        let i = state.selected().map(|i| i.saturating_sub(20)).unwrap_or(0);
        state.select(Some(i));
    }

    pub fn selected_review(&self) -> Option<&PendingReview> {
        self.review_state.selected().and_then(|i| self.reviews.get(i))
    }

    pub fn selected_conflict(&self) -> Option<&ConflictedMerge> {
        self.conflict_state.selected().and_then(|i| self.conflicts.get(i))
    }

    pub fn selected_golden(&self) -> Option<&GoldenRecord> {
        self.golden_state.selected().and_then(|i| self.goldens.get(i))
    }

    /// Merge/reject the selected review, or confirm/reject the selected conflict
    pub fn act<S: ResolutionStore, A: AuditSink>(
        &mut self,
        engine: &mut ResolutionEngine<S, A>,
        verdict: StewardVerdict,
    ) -> Result<()> {
        let message = match self.current_page {
            Page::ReviewQueue => {
                let Some(pair) = self.selected_review().map(|r| r.pair().clone()) else {
                    return Ok(());
                };
                let decision = engine.decide(&pair, verdict, &self.steward)?;
                format!("{} → {}", pair, decision.outcome)
            }
            Page::Conflicts => {
                let Some(id) = self.selected_conflict().map(|c| c.conflict_id.clone()) else {
                    return Ok(());
                };
                let conflict = match verdict {
                    StewardVerdict::Merge => engine.confirm_conflict(&id, &self.steward)?,
                    StewardVerdict::Reject => engine.reject_conflict(&id, &self.steward)?,
                };
                format!("conflict {} → {}", id, conflict.status.as_str())
            }
            Page::GoldenRecords => return Ok(()),
        };

        self.message = Some(message);
        self.load(engine)
    }
}

fn confidence_rank(confidence: ReviewConfidence) -> u8 {
    match confidence {
        ReviewConfidence::High => 0,
        ReviewConfidence::Low => 1,
    }
}

fn clamp(state: &mut TableState, len: usize) {
    let selected = match (state.selected(), len) {
        (_, 0) => None,
        (Some(i), len) => Some(i.min(len - 1)),
        (None, _) => Some(0),
    };
    state.select(selected);
}

pub fn run_ui<S: ResolutionStore, A: AuditSink>(app: &mut App, engine: &mut ResolutionEngine<S, A>) -> Result<()> {
    app.load(engine)?;

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app, engine);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res
}

fn run_app<B: ratatui::backend::Backend, S: ResolutionStore, A: AuditSink>(
    terminal: &mut Terminal<B>,
    app: &mut App,
    engine: &mut ResolutionEngine<S, A>,
) -> Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            let action = match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                KeyCode::Enter => {
                    app.toggle_detail();
                    None
                }
                KeyCode::Tab => {
                    if key.modifiers.contains(KeyModifiers::SHIFT) {
                        app.previous_page();
                    } else {
                        app.next_page();
                    }
                    None
                }
                KeyCode::BackTab => {
                    app.previous_page();
                    None
                }
                KeyCode::Char('m') => Some(StewardVerdict::Merge),
                KeyCode::Char('x') => Some(StewardVerdict::Reject),
                KeyCode::Char('r') => {
                    app.load(engine)?;
                    app.message = Some("reloaded".to_string());
                    None
                }
                KeyCode::Down | KeyCode::Char('j') => {
                    app.next();
                    None
                }
                KeyCode::Up | KeyCode::Char('k') => {
                    app.previous();
                    None
                }
                KeyCode::PageDown => {
                    app.page_down();
                    None
                }
                KeyCode::PageUp => {
                    app.page_up();
                    None
                }
                _ => None,
            };

            if let Some(verdict) = action {
                // A failed steward action is shown, not fatal to the console
                if let Err(err) = app.act(engine, verdict) {
                    app.message = Some(format!("error: {:#}", err));
                }
            }
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with navigation
            Constraint::Min(0),    // Content area
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    let content = if app.show_detail {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(chunks[1]);
        render_detail_panel(f, content_chunks[1], app);
        content_chunks[0]
    } else {
        chunks[1]
    };

    match app.current_page {
        Page::ReviewQueue => render_reviews(f, content, app),
        Page::Conflicts => render_conflicts(f, content, app),
        Page::GoldenRecords => render_goldens(f, content, app),
    }

    render_status_bar(f, chunks[2], app);
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let pages = [
        (Page::ReviewQueue, app.reviews.len()),
        (Page::Conflicts, app.conflicts.len()),
        (Page::GoldenRecords, app.goldens.len()),
    ];

    let mut tab_spans = vec![];
    for (i, (page, count)) in pages.iter().enumerate() {
        if i > 0 {
            tab_spans.push(Span::raw(" │ "));
        }

        let style = if *page == app.current_page {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };

        tab_spans.push(Span::styled(format!("{} ({})", page.title(), count), style));
    }

    tab_spans.push(Span::raw("  |  "));
    tab_spans.push(Span::styled(
        format!("steward: {}", app.steward),
        Style::default().fg(Color::White),
    ));

    let header = Paragraph::new(vec![Line::from(tab_spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));

    f.render_widget(header, area);
}

fn header_row(titles: &[&'static str]) -> Row<'static> {
    let cells = titles.iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    });
    Row::new(cells).style(Style::default().bg(Color::DarkGray)).height(1)
}

fn table_block(title: &str) -> Block<'_> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::White))
        .title(title)
}

fn score_color(composite: f64) -> Color {
    if composite >= 0.75 {
        Color::Green
    } else if composite >= 0.5 {
        Color::Yellow
    } else {
        Color::Red
    }
}

fn render_reviews(f: &mut Frame, area: Rect, app: &mut App) {
    let rows = app.reviews.iter().map(|review| {
        let color = score_color(review.score.composite);
        let confidence = match review.score.tier {
            Tier::Review(ReviewConfidence::High) => "high",
            _ => "low",
        };
        Row::new(vec![
            Cell::from(truncate(review.pair().a(), 28)),
            Cell::from(truncate(review.pair().b(), 28)),
            Cell::from(format!("{:.3}", review.score.composite)).style(Style::default().fg(color)),
            Cell::from(confidence).style(Style::default().fg(color)),
            Cell::from(review.queued_at.format("%Y-%m-%d %H:%M").to_string()),
        ])
        .height(1)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(30),
            Constraint::Length(30),
            Constraint::Length(9),
            Constraint::Length(8),
            Constraint::Length(17),
        ],
    )
    .header(header_row(&["Record A", "Record B", "Score", "Conf.", "Queued"]))
    .block(table_block(" Pending Reviews "))
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.review_state);
}

fn render_conflicts(f: &mut Frame, area: Rect, app: &mut App) {
    let rows = app.conflicts.iter().map(|conflict| {
        Row::new(vec![
            Cell::from(truncate(&conflict.conflict_id, 40)),
            Cell::from(format!("{:.3}", conflict.edge.composite)),
            Cell::from(format!("{} + {}", conflict.left_members.len(), conflict.right_members.len())),
            Cell::from(conflict.contradictions.len().to_string()).style(Style::default().fg(Color::Red)),
            Cell::from(conflict.edge.decided_by.to_string()),
        ])
        .height(1)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(42),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(6),
            Constraint::Length(20),
        ],
    )
    .header(header_row(&["Held Edge", "Score", "Sides", "Diff", "Proposed By"]))
    .block(table_block(" Held Merges "))
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.conflict_state);
}

fn render_goldens(f: &mut Frame, area: Rect, app: &mut App) {
    let rows = app.goldens.iter().map(|golden| {
        let name = format!(
            "{} {}",
            golden.value("first_name").unwrap_or(""),
            golden.value("last_name").unwrap_or("")
        );
        Row::new(vec![
            Cell::from(truncate(&golden.golden_id, 14)),
            Cell::from(truncate(name.trim(), 26)),
            Cell::from(truncate(golden.value("email").unwrap_or("-"), 30)),
            Cell::from(golden.member_record_ids.len().to_string()),
            Cell::from(format!("v{}", golden.version)),
        ])
        .height(1)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(16),
            Constraint::Length(28),
            Constraint::Length(32),
            Constraint::Length(8),
            Constraint::Length(6),
        ],
    )
    .header(header_row(&["Golden Id", "Name", "Email", "Members", "Ver"]))
    .block(table_block(" Golden Records "))
    .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.golden_state);
}

fn label(text: &str) -> Span<'static> {
    Span::styled(
        format!("  {}: ", text),
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
    )
}

fn section(text: &str) -> Line<'static> {
    Line::from(Span::styled(
        format!("  {}", text),
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
    ))
}

fn detail_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines = vec![Line::from("")];
    match app.current_page {
        Page::ReviewQueue => {
            let Some(review) = app.selected_review() else {
                return vec![Line::from("  No review selected")];
            };
            lines.push(Line::from(vec![label("Pair"), Span::raw(review.pair().to_string())]));
            lines.push(Line::from(vec![
                label("Composite"),
                Span::styled(
                    format!("{:.4}", review.score.composite),
                    Style::default().fg(score_color(review.score.composite)),
                ),
            ]));
            lines.push(Line::from(""));
            lines.push(section("COMPONENTS"));
            for (component, score) in &review.score.component_scores {
                lines.push(Line::from(vec![label(component), Span::raw(format!("{:.3}", score))]));
            }
            for component in &review.score.excluded {
                lines.push(Line::from(vec![
                    label(component),
                    Span::styled("not compared", Style::default().fg(Color::DarkGray)),
                ]));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "  m merge · x reject",
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        }
        Page::Conflicts => {
            let Some(conflict) = app.selected_conflict() else {
                return vec![Line::from("  No conflict selected")];
            };
            lines.push(Line::from(vec![label("Edge"), Span::raw(conflict.edge.pair.to_string())]));
            lines.push(Line::from(vec![label("Left"), Span::raw(conflict.left_members.join(", "))]));
            lines.push(Line::from(vec![label("Right"), Span::raw(conflict.right_members.join(", "))]));
            lines.push(Line::from(""));
            lines.push(section("CONTRADICTIONS"));
            for c in &conflict.contradictions {
                lines.push(Line::from(Span::styled(
                    format!("  {}", c),
                    Style::default().fg(Color::Red),
                )));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "  m confirm merge · x keep apart",
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        }
        Page::GoldenRecords => {
            let Some(golden) = app.selected_golden() else {
                return vec![Line::from("  No golden record selected")];
            };
            lines.push(Line::from(vec![label("Golden Id"), Span::raw(golden.golden_id.clone())]));
            lines.push(Line::from(vec![label("Version"), Span::raw(golden.version.to_string())]));
            lines.push(Line::from(vec![label("Members"), Span::raw(golden.member_record_ids.join(", "))]));
            lines.push(Line::from(""));
            lines.push(section("FIELDS"));
            for (name, field) in &golden.fields {
                lines.push(Line::from(vec![
                    label(name),
                    Span::raw(field.value.clone()),
                    Span::styled(
                        format!("  ← {} ({})", field.source_record_id, field.rule.as_str()),
                        Style::default().fg(Color::DarkGray),
                    ),
                ]));
            }
        }
    }
    lines
}

fn render_detail_panel(f: &mut Frame, area: Rect, app: &App) {
    let panel = Paragraph::new(detail_lines(app)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(" Details "),
    );
    f.render_widget(panel, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let (selected, total) = match app.current_page {
        Page::ReviewQueue => (app.review_state.selected(), app.reviews.len()),
        Page::Conflicts => (app.conflict_state.selected(), app.conflicts.len()),
        Page::GoldenRecords => (app.golden_state.selected(), app.goldens.len()),
    };

    let mut status_spans = vec![Span::styled(
        format!(" Row: {}/{} ", selected.map(|i| i + 1).unwrap_or(0), total),
        Style::default().fg(Color::Cyan),
    )];

    if let Some(message) = &app.message {
        status_spans.push(Span::raw(" | "));
        status_spans.push(Span::styled(message.clone(), Style::default().fg(Color::Green)));
    }

    status_spans.push(Span::raw(" | "));
    for (key, what) in [("Enter", " Details | "), ("Tab", " Page | "), ("m/x", " Merge/Reject | "), ("r", " Reload | ")] {
        status_spans.push(Span::styled(key, Style::default().fg(Color::Yellow)));
        status_spans.push(Span::raw(what));
    }
    status_spans.push(Span::styled("q", Style::default().fg(Color::Red)));
    status_spans.push(Span::raw(" Quit"));

    let status_bar = Paragraph::new(vec![Line::from(status_spans)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(status_bar, area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
