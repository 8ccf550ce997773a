mod tests_get;
mod tests_writer;
