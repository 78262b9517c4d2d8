mod connection;
mod dispatch;
mod reaper;
