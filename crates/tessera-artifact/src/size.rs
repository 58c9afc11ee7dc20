const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Render a byte count the way the dashboard shows it ("1.50 MB").
pub fn format_bytes(bytes: u64) -> String {
  if bytes < 1024 {
    return format!("{} B", bytes);
  }

  let mut value = bytes as f64;
  let mut unit = 0;
  while value >= 1024.0 && unit < UNITS.len() - 1 {
    value /= 1024.0;
    unit += 1;
  }
  format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_bytes() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1536), "1.50 KB");
    assert_eq!(format_bytes(75 * 1024 * 1024), "75.00 MB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
  }
}
