use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::{
    Axis, Bar, BarChart, BarGroup, Block, Borders, Cell, Chart, Dataset, GraphType, Paragraph,
    Row, Table, Wrap,
};

use crate::dashboard::{DashboardData, DashboardView};
use crate::error::PipelineError;
use crate::query::QueryEngine;
use crate::report::{BrandMetrics, Deal, StateSummary};

const EVENTS_MAX: usize = 6;
const HINT: &str = "up/down brand  left/right year  r reload  q quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Reload,
    Quit,
}

/// Brand and year cursor; the year list is reloaded whenever the brand changes.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    makes: Vec<String>,
    make_index: usize,
    years: Vec<i64>,
    year_index: usize,
}

impl Selection {
    pub fn new(makes: Vec<String>) -> Self {
        Self {
            makes,
            ..Self::default()
        }
    }

    pub fn make(&self) -> Option<&str> {
        self.makes.get(self.make_index).map(String::as_str)
    }

    pub fn year(&self) -> Option<i64> {
        self.years.get(self.year_index).copied()
    }

    pub fn set_years(&mut self, years: Vec<i64>) {
        self.years = years;
        self.year_index = 0;
    }

    /// Applies a key press; `Reload` means the selection changed.
    pub fn handle_key(&mut self, code: KeyCode) -> Action {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => Action::Quit,
            KeyCode::Char('r') => Action::Reload,
            KeyCode::Down | KeyCode::Char('j') => {
                step(&mut self.make_index, self.makes.len(), 1);
                self.years.clear();
                Action::Reload
            }
            KeyCode::Up | KeyCode::Char('k') => {
                step(&mut self.make_index, self.makes.len(), -1);
                self.years.clear();
                Action::Reload
            }
            // Years are listed newest first, so right moves to older ones.
            KeyCode::Right | KeyCode::Char('l') => {
                step(&mut self.year_index, self.years.len(), 1);
                Action::Reload
            }
            KeyCode::Left | KeyCode::Char('h') => {
                step(&mut self.year_index, self.years.len(), -1);
                Action::Reload
            }
            _ => Action::None,
        }
    }
}

fn step(index: &mut usize, len: usize, delta: isize) {
    if len == 0 {
        *index = 0;
        return;
    }
    *index = (*index as isize + delta).rem_euclid(len as isize) as usize;
}

pub struct Tui<E: QueryEngine> {
    data: DashboardData<E>,
    selection: Selection,
    view: Option<DashboardView>,
    status: String,
    events: VecDeque<String>,
}

impl<E: QueryEngine> Tui<E> {
    pub fn new(mut data: DashboardData<E>) -> Result<Self, PipelineError> {
        let makes = data.makes()?;
        Ok(Self {
            data,
            selection: Selection::new(makes),
            view: None,
            status: "ready".to_string(),
            events: VecDeque::new(),
        })
    }

    pub fn run(&mut self) -> miette::Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let result = self.event_loop(&mut terminal);

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        result
    }

    fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    ) -> miette::Result<()> {
        let mut dirty = true;
        loop {
            if dirty {
                self.status = "loading".to_string();
                terminal
                    .draw(|frame| draw_ui(frame, self))
                    .into_diagnostic()?;
                self.reload();
                dirty = false;
            }
            terminal
                .draw(|frame| draw_ui(frame, self))
                .into_diagnostic()?;

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    match self.handle_key(key) {
                        Action::Quit => return Ok(()),
                        Action::Reload => dirty = true,
                        Action::None => {}
                    }
                }
            }
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Action {
        if key.kind != KeyEventKind::Press {
            return Action::None;
        }
        self.selection.handle_key(key.code)
    }

    fn reload(&mut self) {
        let Some(make) = self.selection.make().map(str::to_string) else {
            self.status = "no makes available".to_string();
            return;
        };
        if self.selection.years.is_empty() {
            match self.data.years(&make) {
                Ok(years) => self.selection.set_years(years),
                Err(err) => {
                    self.fail(err);
                    return;
                }
            }
        }
        let Some(year) = self.selection.year() else {
            return;
        };
        let before = self.data.queries_executed();
        match self.data.view(&make, year) {
            Ok(view) => {
                let issued = self.data.queries_executed() - before;
                self.push_event(format!("{make} {year}: {issued} new quer(ies)"));
                self.status = format!("{} offers", view.metrics.total_offers);
                self.view = Some(view);
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: PipelineError) {
        self.status = format!("error: {err}");
        self.push_event(self.status.clone());
        self.view = None;
    }

    fn push_event(&mut self, message: String) {
        self.events.push_back(message);
        while self.events.len() > EVENTS_MAX {
            self.events.pop_front();
        }
    }
}

fn draw_ui<E: QueryEngine>(frame: &mut ratatui::Frame, tui: &Tui<E>) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Min(10),
            Constraint::Length(9),
            Constraint::Length(4),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(tui), chunks[0]);

    let metrics = tui
        .view
        .as_ref()
        .map(|view| view.metrics.clone())
        .unwrap_or_default();
    frame.render_widget(draw_metrics(&metrics), chunks[1]);

    let charts = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[2]);
    draw_condition_chart(frame, tui.view.as_ref(), charts[0]);
    draw_mileage_chart(frame, tui.view.as_ref(), charts[1]);

    let tables = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(chunks[3]);
    let states = tui
        .view
        .as_ref()
        .map(|view| view.states.as_slice())
        .unwrap_or_default();
    frame.render_widget(draw_states(states), tables[0]);
    let deals = tui.view.as_ref().and_then(|view| view.deals.as_deref());
    frame.render_widget(draw_deals(deals), tables[1]);

    frame.render_widget(draw_footer(tui), chunks[4]);
}

fn draw_header<E: QueryEngine>(tui: &Tui<E>) -> Paragraph<'static> {
    let make = tui.selection.make().unwrap_or("-").to_string();
    let year = tui
        .selection
        .year()
        .map(|year| year.to_string())
        .unwrap_or_else(|| "-".to_string());
    Paragraph::new(Line::from(vec![
        Span::styled(
            "VEHICLE SALES ANALYTICS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("  "),
        Span::styled("Brand: ", Style::default().fg(Color::Gray)),
        Span::styled(make, Style::default().fg(Color::Cyan)),
        Span::styled("   Year: ", Style::default().fg(Color::Gray)),
        Span::styled(year, Style::default().fg(Color::Cyan)),
        Span::styled("   Mode: ", Style::default().fg(Color::Gray)),
        Span::styled(
            tui.data.mode().to_string(),
            Style::default().fg(Color::Green),
        ),
    ]))
    .block(Block::default().borders(Borders::BOTTOM))
    .alignment(Alignment::Left)
}

fn draw_metrics(metrics: &BrandMetrics) -> Paragraph<'static> {
    let price = metrics
        .avg_price
        .map(|value| format!("${}", thousands(value, 2)))
        .unwrap_or_else(|| "n/a".to_string());
    let mileage = metrics
        .avg_mileage
        .map(|value| format!("{} mil", thousands(value, 0)))
        .unwrap_or_else(|| "n/a".to_string());
    Paragraph::new(vec![
        Line::from(vec![
            Span::styled("Number of offers: ", Style::default().fg(Color::Gray)),
            Span::styled(
                thousands(metrics.total_offers as f64, 0),
                Style::default().fg(Color::Yellow),
            ),
        ]),
        Line::from(vec![
            Span::styled("Average price: ", Style::default().fg(Color::Gray)),
            Span::styled(price, Style::default().fg(Color::Yellow)),
            Span::styled("   Average mileage: ", Style::default().fg(Color::Gray)),
            Span::styled(mileage, Style::default().fg(Color::Yellow)),
        ]),
    ])
    .block(Block::default().borders(Borders::ALL).title("Metrics"))
    .wrap(Wrap { trim: true })
}

fn draw_condition_chart(frame: &mut ratatui::Frame, view: Option<&DashboardView>, area: Rect) {
    let bars = view
        .map(|view| {
            view.price_by_condition
                .iter()
                .map(|entry| {
                    Bar::default()
                        .value(entry.avg_price.max(0.0).round() as u64)
                        .label(Line::from(format!("{}", entry.condition)))
                        .text_value(format!("{:.0}k", entry.avg_price / 1000.0))
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let chart = BarChart::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Price vs Condition"),
        )
        .data(BarGroup::default().bars(&bars))
        .bar_width(5)
        .bar_gap(1)
        .bar_style(Style::default().fg(Color::Cyan))
        .value_style(Style::default().fg(Color::Black).bg(Color::Cyan));
    frame.render_widget(chart, area);
}

fn draw_mileage_chart(frame: &mut ratatui::Frame, view: Option<&DashboardView>, area: Rect) {
    let points = view
        .map(|view| view.price_vs_mileage.as_slice())
        .unwrap_or_default();
    let max_x = points.iter().map(|(x, _)| *x).fold(1.0_f64, f64::max);
    let max_y = points.iter().map(|(_, y)| *y).fold(1.0_f64, f64::max);
    let dataset = Dataset::default()
        .name("offers")
        .marker(Marker::Dot)
        .graph_type(GraphType::Scatter)
        .style(Style::default().fg(Color::Yellow))
        .data(points);
    let chart = Chart::new(vec![dataset])
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Price vs Mileage"),
        )
        .x_axis(
            Axis::default()
                .title("odometer")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_x])
                .labels(vec!["0".to_string(), thousands(max_x, 0)]),
        )
        .y_axis(
            Axis::default()
                .title("price")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, max_y])
                .labels(vec!["0".to_string(), thousands(max_y, 0)]),
        );
    frame.render_widget(chart, area);
}

fn draw_states(states: &[StateSummary]) -> Table<'static> {
    let rows = states
        .iter()
        .map(|summary| {
            Row::new(vec![
                Cell::from(summary.state.clone()),
                Cell::from(summary.count.to_string()),
                Cell::from(
                    summary
                        .avg_price
                        .map(|price| thousands(price, 2))
                        .unwrap_or_else(|| "n/a".to_string()),
                ),
            ])
        })
        .collect::<Vec<_>>();
    Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Min(10),
        ],
    )
    .header(Row::new(vec!["State", "Offers", "Avg price"]).style(Style::default().fg(Color::Gray)))
    .block(Block::default().borders(Borders::ALL).title("States"))
}

fn draw_deals(deals: Option<&[Deal]>) -> Table<'static> {
    let title = match deals {
        Some(_) => "Top 5 Best Value Deals",
        None => "Top 5 Best Value Deals (smart-buffer only)",
    };
    let rows = deals
        .unwrap_or_default()
        .iter()
        .map(|deal| {
            Row::new(vec![
                Cell::from(deal.model.clone().unwrap_or_default()),
                Cell::from(deal.condition.map(|c| c.to_string()).unwrap_or_default()),
                Cell::from(
                    deal.odometer
                        .map(|miles| format!("{} mi", thousands(miles, 0)))
                        .unwrap_or_default(),
                ),
                Cell::from(deal.state.clone().unwrap_or_default()),
                Cell::from(format!("${}", thousands(deal.price, 2))),
            ])
        })
        .collect::<Vec<_>>();
    Table::new(
        rows,
        [
            Constraint::Min(12),
            Constraint::Length(9),
            Constraint::Length(12),
            Constraint::Length(6),
            Constraint::Length(12),
        ],
    )
    .header(
        Row::new(vec!["Model", "Condition", "Odometer", "State", "Price"])
            .style(Style::default().fg(Color::Gray)),
    )
    .block(Block::default().borders(Borders::ALL).title(title))
}

fn draw_footer<E: QueryEngine>(tui: &Tui<E>) -> Paragraph<'static> {
    let last = tui.events.back().cloned().unwrap_or_default();
    Paragraph::new(vec![
        Line::from(vec![
            Span::styled("Status: ", Style::default().fg(Color::Gray)),
            Span::styled(tui.status.clone(), Style::default().fg(Color::Green)),
            Span::styled("   Queries: ", Style::default().fg(Color::Gray)),
            Span::raw(tui.data.queries_executed().to_string()),
        ]),
        Line::from(Span::styled(last, Style::default().fg(Color::Gray))),
        Line::from(Span::styled(HINT, Style::default().fg(Color::Gray))),
    ])
    .block(Block::default().borders(Borders::TOP))
}

/// `1234567.891` with `decimals = 2` becomes `1,234,567.89`.
pub fn thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (integer, fraction) = match formatted.split_once('.') {
        Some((integer, fraction)) => (integer.to_string(), Some(fraction.to_string())),
        None => (formatted, None),
    };
    let mut grouped = String::new();
    for (index, ch) in integer.chars().enumerate() {
        if index > 0 && (integer.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if value < 0.0 && value.abs() >= 0.5 / 10f64.powi(decimals as i32) {
        "-"
    } else {
        ""
    };
    match fraction {
        Some(fraction) => format!("{sign}{grouped}.{fraction}"),
        None => format!("{sign}{grouped}"),
    }
}
