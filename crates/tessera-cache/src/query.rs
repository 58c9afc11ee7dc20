//! Filtered, paginated listing shared by the reports and results tables.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

/// What to list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
  /// Only these IDs. An empty set matches nothing.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ids: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<String>,
  /// Case-insensitive substring match on title, ID, project and metadata.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pagination: Option<Pagination>,
}

impl ListQuery {
  pub fn project(mut self, project: impl Into<String>) -> Self {
    self.project = Some(project.into());
    self
  }

  pub fn search(mut self, search: impl Into<String>) -> Self {
    self.search = Some(search.into());
    self
  }

  pub fn ids(mut self, ids: Vec<String>) -> Self {
    self.ids = Some(ids);
    self
  }

  pub fn page(mut self, limit: u32, offset: u32) -> Self {
    self.pagination = Some(Pagination { limit, offset });
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
  pub limit: u32,
  pub offset: u32,
}

/// One page of a listing. `total` counts every row matching the filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  pub total: u64,
}

/// The columns a listing filters on.
pub(crate) struct Table {
  pub name: &'static str,
  pub id_column: &'static str,
  pub columns: &'static str,
  pub search_columns: &'static [&'static str],
}

pub(crate) const RESULTS: Table = Table {
  name: "results",
  id_column: "resultID",
  columns: "resultID, project, title, createdAt, size, sizeBytes, metadata_json",
  search_columns: &["title", "resultID", "project", "metadata_json"],
};

pub(crate) const REPORTS: Table = Table {
  name: "reports",
  id_column: "reportID",
  columns: "reportID, project, title, displayNumber, createdAt, reportUrl, size, sizeBytes, stats_json, metadata_json",
  search_columns: &["title", "reportID", "project", "metadata_json"],
};

/// `SELECT COUNT(*)` with the filters of `query`.
pub(crate) fn count<'a>(table: &Table, query: &'a ListQuery) -> QueryBuilder<'a, Sqlite> {
  let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", table.name));
  push_filters(&mut builder, table, query);
  builder
}

/// The filtered page itself, newest first.
pub(crate) fn select<'a>(table: &Table, query: &'a ListQuery) -> QueryBuilder<'a, Sqlite> {
  let mut builder = QueryBuilder::new(format!("SELECT {} FROM {}", table.columns, table.name));
  push_filters(&mut builder, table, query);
  builder.push(format!(
    " ORDER BY createdAt DESC, {} ASC",
    table.id_column
  ));

  // SQLite wants a LIMIT whenever there is an OFFSET; -1 means unbounded.
  match query.pagination {
    Some(page) => {
      builder.push(" LIMIT ");
      builder.push_bind(i64::from(page.limit));
      builder.push(" OFFSET ");
      builder.push_bind(i64::from(page.offset));
    }
    None => {
      builder.push(" LIMIT -1");
    }
  }
  builder
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, table: &Table, query: &'a ListQuery) {
  builder.push(" WHERE 1 = 1");

  if let Some(ids) = &query.ids {
    if ids.is_empty() {
      builder.push(" AND 0");
    } else {
      builder.push(format!(" AND {} IN (", table.id_column));
      let mut separated = builder.separated(", ");
      for id in ids {
        separated.push_bind(id.as_str());
      }
      separated.push_unseparated(")");
    }
  }

  if let Some(project) = &query.project {
    builder.push(" AND project = ");
    builder.push_bind(project.as_str());
  }

  if let Some(search) = query.search.as_deref().map(str::trim)
    && !search.is_empty()
  {
    let pattern = format!("%{}%", escape_like(&search.to_lowercase()));
    builder.push(" AND (");
    for (i, column) in table.search_columns.iter().enumerate() {
      if i > 0 {
        builder.push(" OR ");
      }
      builder.push(format!("LOWER(COALESCE({}, '')) LIKE ", column));
      builder.push_bind(pattern.clone());
      builder.push(" ESCAPE '\\'");
    }
    builder.push(")");
  }
}

/// Make `%`, `_` and `\` match themselves in a LIKE pattern.
fn escape_like(raw: &str) -> String {
  let mut escaped = String::with_capacity(raw.len());
  for c in raw.chars() {
    if matches!(c, '%' | '_' | '\\') {
      escaped.push('\\');
    }
    escaped.push(c);
  }
  escaped
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_escape_like() {
    assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    assert_eq!(escape_like("plain"), "plain");
  }

  #[test]
  fn test_count_and_select_share_filters() {
    let query = ListQuery::default()
      .project("web")
      .search("Login")
      .ids(vec!["a".to_string(), "b".to_string()])
      .page(10, 20);

    let count_builder = count(&REPORTS, &query);
    let select_builder = select(&REPORTS, &query);
    let count_sql = count_builder.sql();
    let select_sql = select_builder.sql();

    let filter = count_sql
      .strip_prefix("SELECT COUNT(*) FROM reports")
      .unwrap();
    assert!(select_sql.contains(filter));
    assert!(filter.contains("reportID IN (?, ?)"));
    assert!(select_sql.ends_with("LIMIT ? OFFSET ?"));
  }

  #[test]
  fn test_unpaginated_select_is_unbounded() {
    let query = ListQuery::default();
    let builder = select(&RESULTS, &query);
    let sql = builder.sql();
    assert!(sql.ends_with("LIMIT -1"));
    assert!(sql.contains("WHERE 1 = 1 ORDER BY"));
  }
}
