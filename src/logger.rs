use chrono::Local;

/// Log levels for Quill
#[derive(Debug, Clone, Copy)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Components in Quill
#[derive(Debug, Clone, Copy)]
pub enum Component {
    Generation,
    Models,
    Backend,
    Settings,
    Cli,
}

impl Component {
    fn as_str(&self) -> &'static str {
        match self {
            Component::Generation => "GENERATION",
            Component::Models => "MODELS",
            Component::Backend => "BACKEND",
            Component::Settings => "SETTINGS",
            Component::Cli => "CLI",
        }
    }
}

impl LogLevel {
    fn emoji(&self) -> &'static str {
        match self {
            LogLevel::Debug => "🔍",
            LogLevel::Info => "📊",
            LogLevel::Warn => "⚠️",
            LogLevel::Error => "❌",
        }
    }
}

/// Log a message with timestamp, component, and level
pub fn log(component: Component, level: LogLevel, message: &str) {
    let timestamp = Local::now().format("%H:%M:%S%.3f");
    println!(
        "[{}] {} [{}] {}",
        timestamp,
        level.emoji(),
        component.as_str(),
        message
    );
}

// Convenience functions
pub fn debug(component: Component, message: &str) {
    log(component, LogLevel::Debug, message);
}

pub fn info(component: Component, message: &str) {
    log(component, LogLevel::Info, message);
}

pub fn warn(component: Component, message: &str) {
    log(component, LogLevel::Warn, message);
}

pub fn error(component: Component, message: &str) {
    log(component, LogLevel::Error, message);
}
