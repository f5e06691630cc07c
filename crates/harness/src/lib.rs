pub mod briefcase;
pub mod hub;

pub use briefcase::TestBriefcase;
pub use hub::TestHub;

/// Tables every test briefcase starts with.
pub const SEED_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS app_Widget (
    Id INTEGER PRIMARY KEY,
    Name TEXT NOT NULL,
    Size INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS app_Widget_Name ON app_Widget (Name);

CREATE TABLE IF NOT EXISTS app_Part (
    Id INTEGER PRIMARY KEY,
    WidgetId INTEGER REFERENCES app_Widget (Id),
    Label TEXT
);

CREATE TABLE IF NOT EXISTS ec_Class (
    Id INTEGER PRIMARY KEY,
    Name TEXT NOT NULL
);
";
