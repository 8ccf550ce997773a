mod tests_parity;
mod tests_reader;
mod tests_recovery;
mod tests_writer;
