use crate::table::Table;
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Chart kind a snippet asks for through `px::line`, `px::bar` and friends.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphType {
    /// Points of each series joined in x order
    Line,
    /// One bar per x value; several series sit side by side
    Bar,
    Scatter,
    /// Line with the region down to zero shaded
    Area,
}

/// Title, axis labels and canvas size of a figure. `from_table` fills the
/// labels with the column names; snippets override them with `set_title`,
/// `set_labels` and `set_size`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphOptions {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    /// Canvas size in pixels
    pub width: u32,
    pub height: u32,
    pub graph_type: GraphType,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            title: "Graph".to_string(),
            x_label: "X Axis".to_string(),
            y_label: "Y Axis".to_string(),
            width: 800,
            height: 600,
            graph_type: GraphType::Line,
        }
    }
}

/// One named run of (x, y) points.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub points: Vec<(f64, f64)>,
}

/// A chart built by a snippet.
///
/// When the x column is not numeric its distinct values are laid out at
/// positions 0, 1, 2, ... and kept in `categories` for axis labels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub options: GraphOptions,
    pub series: Vec<Series>,
    pub categories: Option<Vec<String>>,
}

impl Figure {
    /// Creates a figure from table columns
    ///
    /// Rows whose y value is not numeric are skipped.
    ///
    /// # Arguments
    /// * `table` - Source table
    /// * `x` - Column for X values, numeric or categorical
    /// * `y` - Column for Y values
    /// * `color` - Optional column splitting rows into one series per value
    /// * `graph_type` - Which chart to draw
    ///
    /// # Errors
    /// * Returns an error if a named column does not exist
    pub fn from_table(
        table: &Table,
        x: &str,
        y: &str,
        color: Option<&str>,
        graph_type: GraphType,
    ) -> Result<Figure, String> {
        let xs = table.column(x)?;
        let ys = table.column(y)?;
        let groups = match color {
            Some(c) => Some(table.column(c)?),
            None => None,
        };

        let categorical = xs.iter().any(|v| !v.is_null() && v.as_f64().is_none());
        let mut categories: Vec<String> = Vec::new();
        let mut category_pos: HashMap<String, usize> = HashMap::new();

        let mut series: Vec<Series> = Vec::new();
        let mut series_pos: HashMap<String, usize> = HashMap::new();

        for (i, (xv, yv)) in xs.iter().zip(ys.iter()).enumerate() {
            let Some(yf) = yv.as_f64() else { continue };
            let xf = if categorical {
                let label = xv.to_string();
                let next = categories.len();
                let pos = *category_pos.entry(label.clone()).or_insert_with(|| {
                    categories.push(label);
                    next
                });
                pos as f64
            } else {
                match xv.as_f64() {
                    Some(f) => f,
                    None => continue,
                }
            };

            let name = match &groups {
                Some(g) => g[i].to_string(),
                None => y.to_string(),
            };
            let idx = *series_pos.entry(name.clone()).or_insert_with(|| {
                series.push(Series {
                    name,
                    points: Vec::new(),
                });
                series.len() - 1
            });
            series[idx].points.push((xf, yf));
        }

        if matches!(graph_type, GraphType::Line | GraphType::Area) {
            for s in series.iter_mut() {
                s.points
                    .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            }
        }

        Ok(Figure {
            options: GraphOptions {
                title: format!("{} by {}", y, x),
                x_label: x.to_string(),
                y_label: y.to_string(),
                graph_type,
                ..GraphOptions::default()
            },
            series,
            categories: if categorical { Some(categories) } else { None },
        })
    }

    pub fn point_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    // Axis ranges with a little headroom; bars always include zero
    fn bounds(&self) -> (std::ops::Range<f64>, std::ops::Range<f64>) {
        let points = self.series.iter().flat_map(|s| s.points.iter());
        let (mut min_x, mut max_x, mut min_y, mut max_y) =
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for &(x, y) in points {
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }
        if !min_x.is_finite() {
            return (0.0..1.0, 0.0..1.0);
        }
        if matches!(self.options.graph_type, GraphType::Bar | GraphType::Area) {
            min_y = min_y.min(0.0);
            max_y = max_y.max(0.0);
        }
        if self.categories.is_some() || self.options.graph_type == GraphType::Bar {
            min_x -= 0.5;
            max_x += 0.5;
        }
        if min_x == max_x {
            min_x -= 1.0;
            max_x += 1.0;
        }
        if min_y == max_y {
            min_y -= 1.0;
            max_y += 1.0;
        }
        let pad = (max_y - min_y) * 0.05;
        (min_x..max_x, (min_y - pad)..(max_y + pad))
    }
}

/// Renders a figure as an SVG document
///
/// # Arguments
/// * `figure` - The figure to draw
///
/// # Returns
/// * A Result containing the SVG markup or an error
pub fn render_svg(figure: &Figure) -> Result<String, Box<dyn std::error::Error>> {
    let options = &figure.options;
    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, (options.width, options.height))
            .into_drawing_area();
        root.fill(&WHITE)?;

        let (x_range, y_range) = figure.bounds();
        let mut chart = ChartBuilder::on(&root)
            .caption(&options.title, ("sans-serif", 30).into_font())
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(40)
            .build_cartesian_2d(x_range, y_range)?;

        let categories = figure.categories.clone();
        let label_x = move |v: &f64| match &categories {
            Some(cats) => {
                let rounded = v.round();
                if (v - rounded).abs() < 1e-9 && rounded >= 0.0 {
                    cats.get(rounded as usize).cloned().unwrap_or_default()
                } else {
                    String::new()
                }
            }
            None => format!("{}", v),
        };

        chart
            .configure_mesh()
            .x_desc(&options.x_label)
            .y_desc(&options.y_label)
            .x_label_formatter(&label_x)
            .draw()?;

        let n = figure.series.len().max(1) as f64;
        for (i, s) in figure.series.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            match options.graph_type {
                GraphType::Line => {
                    chart
                        .draw_series(LineSeries::new(s.points.iter().copied(), &color))?
                        .label(s.name.as_str())
                        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
                }
                GraphType::Scatter => {
                    chart
                        .draw_series(
                            s.points
                                .iter()
                                .map(|&(x, y)| Circle::new((x, y), 3, color.filled())),
                        )?
                        .label(s.name.as_str())
                        .legend(move |(x, y)| Circle::new((x + 10, y), 3, color.filled()));
                }
                GraphType::Bar => {
                    // Bars of several series share each slot side by side
                    let width = 0.8 / n;
                    let offset = -0.4 + width * i as f64;
                    chart
                        .draw_series(s.points.iter().map(|&(x, y)| {
                            Rectangle::new(
                                [(x + offset, 0.0), (x + offset + width, y)],
                                color.filled(),
                            )
                        }))?
                        .label(s.name.as_str())
                        .legend(move |(x, y)| {
                            Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled())
                        });
                }
                GraphType::Area => {
                    chart
                        .draw_series(
                            AreaSeries::new(s.points.iter().copied(), 0.0, color.mix(0.3))
                                .border_style(color),
                        )?
                        .label(s.name.as_str())
                        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
                }
            }
        }

        if figure.series.len() > 1 {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }

        root.present()?;
    }

    Ok(svg)
}

/// Standalone HTML page for a figure: the chart plus its data points.
pub fn to_html(figure: &Figure) -> Result<String, Box<dyn std::error::Error>> {
    let svg = render_svg(figure)?;
    let mut rows = String::new();
    for s in &figure.series {
        for &(x, y) in &s.points {
            let x_text = match &figure.categories {
                Some(cats) => cats.get(x as usize).cloned().unwrap_or_default(),
                None => x.to_string(),
            };
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                escape_html(&s.name),
                escape_html(&x_text),
                y
            ));
        }
    }

    Ok(format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
<style>body{{font-family:sans-serif}} svg title{{pointer-events:none}} table{{border-collapse:collapse}} td,th{{border:1px solid #ccc;padding:2px 6px}}</style>\n\
</head>\n<body>\n{svg}\n<details><summary>Data</summary>\n<table>\n<tr><th>series</th><th>{x}</th><th>{y}</th></tr>\n{rows}</table>\n</details>\n</body>\n</html>\n",
        title = escape_html(&figure.options.title),
        svg = svg,
        x = escape_html(&figure.options.x_label),
        y = escape_html(&figure.options.y_label),
        rows = rows,
    ))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::from_delimited;

    fn table() -> Table {
        from_delimited(b"month,total,region\n3,30,east\n1,10,east\n2,25,west\n").unwrap()
    }

    #[test]
    fn numeric_line_sorted_by_x() {
        let fig = Figure::from_table(&table(), "month", "total", None, GraphType::Line).unwrap();
        assert_eq!(fig.series.len(), 1);
        assert_eq!(fig.series[0].points, vec![(1.0, 10.0), (2.0, 25.0), (3.0, 30.0)]);
        assert!(fig.categories.is_none());
    }

    #[test]
    fn color_column_splits_series() {
        let fig =
            Figure::from_table(&table(), "month", "total", Some("region"), GraphType::Scatter)
                .unwrap();
        let names: Vec<&str> = fig.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["east", "west"]);
        assert_eq!(fig.point_count(), 3);
    }

    #[test]
    fn text_x_becomes_categories() {
        let fig = Figure::from_table(&table(), "region", "total", None, GraphType::Bar).unwrap();
        assert_eq!(fig.categories, Some(vec!["east".to_string(), "west".to_string()]));
        assert_eq!(fig.series[0].points[2], (1.0, 25.0));
    }

    #[test]
    fn missing_column_is_an_error() {
        assert!(Figure::from_table(&table(), "nope", "total", None, GraphType::Line).is_err());
    }

    #[test]
    fn every_graph_type_renders_svg() {
        for graph_type in [GraphType::Line, GraphType::Bar, GraphType::Scatter, GraphType::Area] {
            let fig =
                Figure::from_table(&table(), "month", "total", Some("region"), graph_type).unwrap();
            let svg = render_svg(&fig).unwrap();
            assert!(svg.contains("<svg"));
        }
    }

    #[test]
    fn html_export_is_standalone() {
        let fig = Figure::from_table(&table(), "month", "total", None, GraphType::Line).unwrap();
        let html = to_html(&fig).unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<svg"));
        assert!(html.contains("total by month"));
    }
}
