//! Интеграция с systemd через sd-notify.
//!
//! - READY=1 после инициализации коллектора
//! - STATUS=... с краткой статистикой циклов

use anyhow::{Context, Result};
use libsystemd::daemon::NotifyState;

/// Максимальная длина строки статуса.
const MAX_STATUS_LEN: usize = 200;

/// Отправляет systemd уведомление READY=1.
///
/// Вне systemd возвращает ошибку, которую можно игнорировать.
pub fn notify_ready() -> Result<()> {
    libsystemd::daemon::notify(false, &[NotifyState::Ready])
        .context("Failed to send READY notification to systemd")?;
    Ok(())
}

/// Отправляет systemd уведомление STATUS=..., видимое в `systemctl status podwattd`.
///
/// Ошибки игнорируются: вне systemd это нормально.
pub fn notify_status(status: &str) {
    let state = NotifyState::Status(truncate_status(status).to_string());
    let _ = libsystemd::daemon::notify(false, &[state]);
}

/// Обрезает статус до [`MAX_STATUS_LEN`] байт по границе символа.
fn truncate_status(status: &str) -> &str {
    if status.len() <= MAX_STATUS_LEN {
        return status;
    }
    let mut end = MAX_STATUS_LEN;
    while !status.is_char_boundary(end) {
        end -= 1;
    }
    &status[..end]
}
