mod tests_seal;
