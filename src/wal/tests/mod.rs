pub mod helpers;
mod tests_corruption;
mod tests_replay;
