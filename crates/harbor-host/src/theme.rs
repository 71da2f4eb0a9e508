use harbor_core::{ResolvedTheme, ThemeMode, ThemeSetting};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeOrigin {
    Os,
    Local,
    Surface,
}

impl ThemeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeOrigin::Os => "os",
            ThemeOrigin::Local => "local",
            ThemeOrigin::Surface => "surface",
        }
    }
}

/// Side effects the coordinator owes for one theme change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThemeChange {
    pub setting: ThemeSetting,
    pub origin: ThemeOrigin,
    /// Native chrome must repaint.
    pub resolved_changed: bool,
    /// Mode must be written back to settings.
    pub persist: bool,
    /// Surface gets `host.themeChanged`.
    pub notify_surface: bool,
}

/// Keeps the theme mode, the last OS signal and the resolved theme consistent.
#[derive(Debug, Clone)]
pub struct ThemeSync {
    os_theme: ResolvedTheme,
    setting: ThemeSetting,
}

impl ThemeSync {
    pub fn new(mode: ThemeMode, os_theme: ResolvedTheme) -> Self {
        Self {
            os_theme,
            setting: ThemeSetting::new(mode, os_theme),
        }
    }

    pub fn setting(&self) -> ThemeSetting {
        self.setting
    }

    /// OS appearance flipped. Only matters while following the system.
    pub fn on_os_theme(&mut self, os_theme: ResolvedTheme) -> Option<ThemeChange> {
        self.os_theme = os_theme;
        if self.setting.mode != ThemeMode::System {
            return None;
        }
        self.transition(ThemeMode::System, ThemeOrigin::Os)
    }

    /// Mode picked through native UI.
    pub fn set_mode(&mut self, mode: ThemeMode) -> Option<ThemeChange> {
        self.transition(mode, ThemeOrigin::Local)
    }

    /// Theme picked inside the surface. Pins an explicit mode.
    pub fn apply_surface(&mut self, theme: ResolvedTheme) -> Option<ThemeChange> {
        self.transition(ThemeMode::from(theme), ThemeOrigin::Surface)
    }

    fn transition(&mut self, mode: ThemeMode, origin: ThemeOrigin) -> Option<ThemeChange> {
        let next = ThemeSetting::new(mode, self.os_theme);
        if next == self.setting {
            return None;
        }
        let resolved_changed = next.resolved != self.setting.resolved;
        let mode_changed = next.mode != self.setting.mode;
        self.setting = next;

        let change = ThemeChange {
            setting: next,
            origin,
            resolved_changed,
            persist: mode_changed && origin != ThemeOrigin::Os,
            notify_surface: resolved_changed && origin != ThemeOrigin::Surface,
        };
        info!(
            event = "theme_transition",
            origin = origin.as_str(),
            mode = %next.mode,
            resolved = %next.resolved,
            persist = change.persist
        );
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_changes_are_ignored_under_an_explicit_mode() {
        let mut sync = ThemeSync::new(ThemeMode::Light, ResolvedTheme::Light);
        assert_eq!(sync.on_os_theme(ResolvedTheme::Dark), None);
        assert_eq!(sync.setting().resolved, ResolvedTheme::Light);

        let change = sync.set_mode(ThemeMode::System).expect("change");
        assert_eq!(change.setting.resolved, ResolvedTheme::Dark);
        assert!(change.persist && change.notify_surface && change.resolved_changed);
    }

    #[test]
    fn os_changes_under_system_repaint_without_persisting() {
        let mut sync = ThemeSync::new(ThemeMode::System, ResolvedTheme::Light);
        let change = sync.on_os_theme(ResolvedTheme::Dark).expect("change");
        assert!(!change.persist);
        assert!(change.notify_surface);
        assert_eq!(sync.on_os_theme(ResolvedTheme::Dark), None);
    }

    #[test]
    fn system_mode_follows_every_os_flip() {
        let mut sync = ThemeSync::new(ThemeMode::System, ResolvedTheme::Dark);
        let mut seen = Vec::new();
        for os in [ResolvedTheme::Light, ResolvedTheme::Dark] {
            sync.on_os_theme(os).expect("change");
            seen.push(sync.setting().resolved);
        }
        assert_eq!(seen, vec![ResolvedTheme::Light, ResolvedTheme::Dark]);

        let mut pinned = ThemeSync::new(ThemeMode::Dark, ResolvedTheme::Dark);
        for os in [ResolvedTheme::Light, ResolvedTheme::Dark, ResolvedTheme::Light] {
            assert_eq!(pinned.on_os_theme(os), None);
            assert_eq!(pinned.setting().resolved, ResolvedTheme::Dark);
        }
    }

    #[test]
    fn surface_theme_pins_the_mode_and_is_not_echoed() {
        let mut sync = ThemeSync::new(ThemeMode::System, ResolvedTheme::Light);
        let change = sync.apply_surface(ResolvedTheme::Dark).expect("change");
        assert_eq!(change.setting.mode, ThemeMode::Dark);
        assert!(change.persist);
        assert!(!change.notify_surface);
        assert!(change.resolved_changed);

        assert_eq!(sync.on_os_theme(ResolvedTheme::Light), None);
        assert_eq!(sync.setting().resolved, ResolvedTheme::Dark);
    }

    #[test]
    fn switching_to_system_with_matching_os_only_persists() {
        let mut sync = ThemeSync::new(ThemeMode::Dark, ResolvedTheme::Dark);
        let change = sync.set_mode(ThemeMode::System).expect("change");
        assert!(change.persist);
        assert!(!change.resolved_changed);
        assert!(!change.notify_surface);
    }
}
