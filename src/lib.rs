/*!
# FlashDash

Upload tables, run a short analysis snippet against them, chart the result and
keep snippet plus data as a named project for later.

## Overview

Users drop one or more tabular files (CSV and friends, or spreadsheets) into a
workspace. Every file becomes a named table; all of them together form the
combined view `df_all`, tagged per row with the file it came from. A Rhai
snippet then runs against these tables, prints or `show`s results and may bind
a chart to `fig`, which can be downloaded as a standalone HTML page. The
snippet and its data can be saved as a project in object storage, listed,
loaded back, updated and deleted, with an expiry date per project.

## Architecture

### Data Layer
- **cell**: `Value`, one inferred table cell
- **table**: `Table` and the per-session dataset `Registry`
- **loader**: ingestion with spreadsheet to delimited-text fallback
- **views**: the combined view and the `df_<stem>` aliases

### Execution Layer
- **executor**: sandboxed snippet runs with an import denylist
- **graph**: figures built by snippets, rendered to SVG and HTML

### Persistence Layer
- **saving**: gzip-compressed tar archives (`snippet.rhai`, `meta.json`, `data/<file>`)
- **storage**: `ObjectStore` trait with in-memory and S3 backends
- **projects**: save, list, load, update, delete and expiry of projects
- **expiry**: expiry dates and urgency badges
- **downloader**: CSV and XLSX export

### Session Layer
- **workspace**: explicit per-session state machine, `(state, event) -> state`
- **auth**, **app**, **config** (feature `web`): identity header, HTTP routes
  and server configuration

## REST API Endpoints

- `GET /api/workspace` - Current workspace state
- `POST /api/workspace/uploads` - Replace the upload selection (multipart `files`)
- `POST /api/workspace/run` - Commit and run a snippet
- `GET /api/workspace/figure.html` - Last figure as HTML
- `GET /api/workspace/export?format=csv|xlsx` - Combined view download
- `POST /api/workspace/save`, `POST /api/workspace/update` - Persist as project
- `GET /api/projects` - Saved projects with expiry badges
- `POST /api/projects/{id}/load`, `DELETE /api/projects/{id}` - Load or delete
- `PUT /api/projects/{id}/expiry` - Change or disable expiry
*/

pub mod cell;
pub mod downloader;
pub mod error;
pub mod executor;
pub mod expiry;
pub mod graph;
pub mod loader;
pub mod projects;
pub mod saving;
pub mod storage;
pub mod table;
pub mod views;
pub mod workspace;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod auth;
#[cfg(feature = "web")]
pub mod config;

pub use error::{FlashError, Result};
