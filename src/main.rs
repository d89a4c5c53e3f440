fn main() {
    persistbench::cmdline();
}
